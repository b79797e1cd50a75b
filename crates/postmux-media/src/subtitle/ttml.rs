//! TTML parsing.

use super::{ConvertOptions, Cue};
use crate::{Error, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;

const NEW_LINE: &str = "\r\n";

/// Prefix that moves an SRT cue to the top of the frame.
const TOP_POSITION: &str = "{\\an8}";

/// Styling attributes of an element, a `<style>` or a `<region>`.
#[derive(Debug, Clone, Default)]
struct Styling {
    italic: bool,
    bold: bool,
    underline: bool,
    color: Option<String>,
    display_align: Option<String>,
    origin: Option<String>,
}

impl Styling {
    /// Fill unset fields from `other`.
    fn inherit(&mut self, other: &Styling) {
        self.italic |= other.italic;
        self.bold |= other.bold;
        self.underline |= other.underline;
        if self.color.is_none() {
            self.color = other.color.clone();
        }
        if self.display_align.is_none() {
            self.display_align = other.display_align.clone();
        }
        if self.origin.is_none() {
            self.origin = other.origin.clone();
        }
    }

    fn open_tags(&self) -> (String, String) {
        let mut open = String::new();
        let mut close = String::new();
        if let Some(color) = &self.color {
            open.push_str(&format!("<font color=\"{}\">", color));
            close.insert_str(0, "</font>");
        }
        for (enabled, tag) in [(self.bold, "b"), (self.italic, "i"), (self.underline, "u")] {
            if enabled {
                open.push_str(&format!("<{}>", tag));
                close.insert_str(0, &format!("</{}>", tag));
            }
        }
        (open, close)
    }

    /// Top alignment or an origin in the upper half of the frame.
    fn is_top(&self) -> bool {
        if self.display_align.as_deref() == Some("before") {
            return true;
        }
        self.origin
            .as_deref()
            .and_then(|origin| origin.split_whitespace().nth(1))
            .and_then(|y| y.strip_suffix('%'))
            .and_then(|y| y.parse::<f64>().ok())
            .is_some_and(|y| y < 50.0)
    }
}

/// Attributes of one element, keyed by local name.
struct Attributes(HashMap<String, String>);

impl Attributes {
    fn read(element: &BytesStart<'_>) -> Result<Self> {
        let mut map = HashMap::new();
        for attr in element.attributes() {
            let attr = attr.map_err(|e| Error::malformed(format!("TTML attribute: {}", e)))?;
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let raw = std::str::from_utf8(&attr.value)
                .map_err(|e| Error::malformed(format!("TTML attribute is not UTF-8: {}", e)))?;
            map.insert(key, unescape(raw)?);
        }
        Ok(Self(map))
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Inline styling plus the referenced `style` ids.
    fn styling(&self, styles: &HashMap<String, Styling>) -> Styling {
        let mut styling = Styling {
            italic: self.get("fontStyle") == Some("italic"),
            bold: self.get("fontWeight") == Some("bold"),
            underline: self
                .get("textDecoration")
                .is_some_and(|d| d.split_whitespace().any(|v| v == "underline")),
            color: self.get("color").map(str::to_owned),
            display_align: self.get("displayAlign").map(str::to_owned),
            origin: self.get("origin").map(str::to_owned),
        };
        for id in self.get("style").unwrap_or_default().split_whitespace() {
            if let Some(style) = styles.get(id) {
                styling.inherit(style);
            }
        }
        styling
    }
}

fn resolve_entity(name: &str) -> Option<&'static str> {
    Some(match name {
        "lt" => "<",
        "gt" => ">",
        "amp" => "&",
        "apos" => "'",
        "quot" => "\"",
        "nbsp" => "\u{A0}",
        "lrm" => "\u{200E}",
        "rlm" => "\u{200F}",
        "ndash" => "\u{2013}",
        "mdash" => "\u{2014}",
        "hellip" => "\u{2026}",
        _ => return None,
    })
}

fn unescape(raw: &str) -> Result<String> {
    quick_xml::escape::unescape_with(raw, resolve_entity)
        .map(|text| text.into_owned())
        .map_err(|e| Error::malformed(format!("TTML text: {}", e)))
}

/// Normalize decoded text: CRLF line breaks, plain spaces, no invisible characters.
fn push_normalized(out: &mut String, text: &str) {
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str(NEW_LINE);
            }
            '\n' => out.push_str(NEW_LINE),
            '\t' | '\u{A0}' | '\u{2000}'..='\u{200A}' | '\u{202F}' | '\u{205F}' | '\u{3000}' => out.push(' '),
            '\u{200B}' | '\u{200E}' | '\u{200F}' => {}
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
}

/// Parse a TTML time expression into milliseconds.
///
/// Accepts clock time (`hh:mm:ss.fff`, frames ignored) and offset time with
/// an `h`, `m`, `s` or `ms` suffix; a bare number counts seconds.
pub fn parse_time(value: &str) -> Result<u64> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(0);
    }
    if value.starts_with("wallclock(") {
        return Err(Error::unsupported_subtitle(format!("wallclock time '{}'", value)));
    }
    let invalid = || Error::malformed(format!("invalid TTML time '{}'", value));

    if value.contains(':') {
        let parts: Vec<&str> = value.split(':').collect();
        if parts.len() < 3 {
            return Err(invalid());
        }
        let hours: u64 = parts[0].parse().map_err(|_| invalid())?;
        let minutes: u64 = parts[1].parse().map_err(|_| invalid())?;
        let seconds: f64 = parts[2].parse().map_err(|_| invalid())?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(invalid());
        }
        return Ok(hours * 3_600_000 + minutes * 60_000 + (seconds * 1000.0).round() as u64);
    }

    let (number, scale) = if let Some(n) = value.strip_suffix("ms") {
        (n, 1.0)
    } else if let Some(n) = value.strip_suffix('h') {
        (n, 3_600_000.0)
    } else if let Some(n) = value.strip_suffix('m') {
        (n, 60_000.0)
    } else if let Some(n) = value.strip_suffix('s') {
        (n, 1000.0)
    } else if value.ends_with(|c: char| c.is_ascii_digit()) {
        (value, 1000.0)
    } else {
        return Err(Error::unsupported_subtitle(format!("time metric in '{}'", value)));
    };

    let number: f64 = number.parse().map_err(|_| invalid())?;
    if !number.is_finite() || number < 0.0 {
        return Err(invalid());
    }
    Ok((number * scale).round() as u64)
}

/// Open `<p>` being collected.
struct Paragraph {
    start_ms: u64,
    end_ms: u64,
    prefix: String,
    text: String,
    /// Closing tags of open elements, innermost last.
    closers: Vec<String>,
}

/// Parse a TTML document into cues.
pub fn parse_ttml(xml: &str, options: &ConvertOptions) -> Result<Vec<Cue>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().check_end_names = false;

    let mut styles: HashMap<String, Styling> = HashMap::new();
    let mut regions: HashMap<String, Styling> = HashMap::new();
    let mut cues = Vec::new();
    let mut paragraph: Option<Paragraph> = None;
    let mut seen_root = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| Error::malformed(format!("TTML at {}: {}", reader.buffer_position(), e)))?;

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let empty = matches!(event, Event::Empty(_));
                let name = e.local_name();
                let name = name.as_ref();

                if !seen_root {
                    if name != b"tt" {
                        return Err(Error::unsupported_subtitle("document root is not <tt>"));
                    }
                    seen_root = true;
                    continue;
                }

                match (name, paragraph.is_some()) {
                    (b"style", false) => {
                        let attrs = Attributes::read(e)?;
                        if let Some(id) = attrs.get("id") {
                            let styling = attrs.styling(&styles);
                            styles.insert(id.to_owned(), styling);
                        }
                    }
                    (b"region", false) => {
                        let attrs = Attributes::read(e)?;
                        if let Some(id) = attrs.get("id") {
                            let styling = attrs.styling(&styles);
                            regions.insert(id.to_owned(), styling);
                        }
                    }
                    (b"p", false) => {
                        let p = open_paragraph(&Attributes::read(e)?, &styles, &regions, options)?;
                        if empty {
                            cues.push(finish_paragraph(p));
                        } else {
                            paragraph = Some(p);
                        }
                    }
                    (_, true) => {
                        if let Some(p) = paragraph.as_mut() {
                            if name == b"br" {
                                p.text.push_str(NEW_LINE);
                                continue;
                            }
                            let close = if options.keep_formatting {
                                let (open, close) = Attributes::read(e)?.styling(&styles).open_tags();
                                p.text.push_str(&open);
                                close
                            } else {
                                String::new()
                            };
                            if empty {
                                p.text.push_str(&close);
                            } else {
                                p.closers.push(close);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Event::End(ref e) => {
                let name = e.local_name();
                if name.as_ref() == b"br" {
                    continue;
                }
                if let Some(mut p) = paragraph.take() {
                    let close = p.closers.pop().unwrap_or_default();
                    p.text.push_str(&close);
                    if p.closers.is_empty() {
                        cues.push(finish_paragraph(p));
                    } else {
                        paragraph = Some(p);
                    }
                }
            }
            Event::Text(ref t) => {
                if let Some(p) = paragraph.as_mut() {
                    let raw = std::str::from_utf8(t)
                        .map_err(|e| Error::malformed(format!("TTML text is not UTF-8: {}", e)))?;
                    push_normalized(&mut p.text, &unescape(raw)?);
                }
            }
            Event::CData(ref t) => {
                if let Some(p) = paragraph.as_mut() {
                    push_normalized(&mut p.text, &String::from_utf8_lossy(t));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_root {
        return Err(Error::unsupported_subtitle("no <tt> element"));
    }

    if options.ignore_empty_frames {
        cues.retain(|cue: &Cue| !cue.is_blank());
    }
    if options.detect_duplicate_lines {
        trim_rolling_lines(&mut cues);
    }
    Ok(cues)
}

fn open_paragraph(
    attrs: &Attributes,
    styles: &HashMap<String, Styling>,
    regions: &HashMap<String, Styling>,
    options: &ConvertOptions,
) -> Result<Paragraph> {
    let start_ms = parse_time(attrs.get("begin").unwrap_or_default())?;
    let end_ms = match (attrs.get("end"), attrs.get("dur")) {
        (Some(end), _) => parse_time(end)?,
        (None, Some(dur)) => start_ms + parse_time(dur)?,
        (None, None) => start_ms,
    };

    let mut styling = attrs.styling(styles);
    if let Some(region) = attrs.get("region").and_then(|id| regions.get(id)) {
        styling.inherit(region);
    }

    let mut prefix = String::new();
    if options.honor_positioning && styling.is_top() {
        prefix.push_str(TOP_POSITION);
    }
    let close = if options.keep_formatting {
        let (open, close) = styling.open_tags();
        prefix.push_str(&open);
        close
    } else {
        String::new()
    };

    Ok(Paragraph {
        start_ms,
        end_ms,
        prefix,
        text: String::new(),
        closers: vec![close],
    })
}

fn finish_paragraph(p: Paragraph) -> Cue {
    let text = if p.prefix.is_empty() {
        p.text
    } else {
        format!("{}{}", p.prefix, p.text)
    };
    Cue {
        start_ms: p.start_ms,
        end_ms: p.end_ms.max(p.start_ms),
        text,
    }
}

/// Auto-generated captions repeat each line while the next one rolls in.
/// Cut every overlapping cue at the start of its successor.
fn trim_rolling_lines(cues: &mut [Cue]) {
    for i in 1..cues.len() {
        let next_start = cues[i].start_ms;
        let cue = &mut cues[i - 1];
        if cue.end_ms > next_start && next_start > cue.start_ms {
            cue.end_ms = next_start;
        }
    }
}
