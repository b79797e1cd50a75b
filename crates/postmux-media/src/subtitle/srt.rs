use super::Cue;
use crate::stream::OutputSink;
use crate::Result;
use std::fmt::Write;

const NEW_LINE: &str = "\r\n";

/// Format milliseconds as an SRT timestamp (HH:MM:SS,mmm).
pub fn format_timestamp(ms: u64) -> String {
    let total_secs = ms / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    let millis = ms % 1000;
    format!("{hours:02}:{minutes:02}:{seconds:02},{millis:03}")
}

/// Write numbered SRT blocks. Returns the number of bytes written.
pub fn write_srt<O: OutputSink + ?Sized>(cues: &[Cue], sink: &mut O) -> Result<u64> {
    let mut written = 0;
    let mut block = String::with_capacity(128);
    for (i, cue) in cues.iter().enumerate() {
        block.clear();
        // writing into a String cannot fail
        let _ = write!(
            block,
            "{}{NEW_LINE}{} --> {}{NEW_LINE}{}{NEW_LINE}{NEW_LINE}",
            i + 1,
            format_timestamp(cue.start_ms),
            format_timestamp(cue.end_ms),
            cue.text
        );
        sink.write_all(block.as_bytes())?;
        written += block.len() as u64;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "00:00:00,000");
        assert_eq!(format_timestamp(3_723_045), "01:02:03,045");
        assert_eq!(format_timestamp(360_000_000), "100:00:00,000");
    }

    #[test]
    fn test_write_srt() {
        let cues = vec![
            Cue {
                start_ms: 1000,
                end_ms: 2000,
                text: "Hello".into(),
            },
            Cue {
                start_ms: 2500,
                end_ms: 4000,
                text: "two\r\nlines".into(),
            },
        ];
        let mut output = Vec::new();
        let written = write_srt(&cues, &mut output).unwrap();
        assert_eq!(written, output.len() as u64);
        assert_eq!(
            String::from_utf8(output).unwrap(),
            "1\r\n00:00:01,000 --> 00:00:02,000\r\nHello\r\n\r\n\
             2\r\n00:00:02,500 --> 00:00:04,000\r\ntwo\r\nlines\r\n\r\n"
        );
    }
}
