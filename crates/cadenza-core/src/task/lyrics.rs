use crate::error::ValidationError;

/// Checks that an uploaded lyrics file is line-timed (LRC) text and returns
/// it decoded.
///
/// Only the shape is checked: UTF-8, not blank, and at least one line that
/// starts with a `[mm:ss]` or `[mm:ss.xx]` time tag. Metadata tags such as
/// `[ar:...]` are allowed alongside.
pub fn validate_lyrics(raw: &[u8]) -> Result<String, ValidationError> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| ValidationError::Lyrics(format!("not valid UTF-8: {e}")))?;
    let text = text.trim_start_matches('\u{feff}');
    if text.trim().is_empty() {
        return Err(ValidationError::Lyrics("file is empty".to_owned()));
    }
    if !text.lines().any(|line| time_tag(line).is_some()) {
        return Err(ValidationError::Lyrics(
            "no [mm:ss.xx] time tags found".to_owned(),
        ));
    }
    Ok(text.to_owned())
}

/// Offset in seconds of the leading time tag of `line`, if any.
fn time_tag(line: &str) -> Option<f64> {
    let rest = line.trim_start().strip_prefix('[')?;
    let (tag, _) = rest.split_once(']')?;
    let (minutes, seconds) = tag.split_once(':')?;
    if minutes.is_empty() || !minutes.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if seconds.is_empty() || !seconds.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return None;
    }
    let minutes: f64 = minutes.parse().ok()?;
    let seconds: f64 = seconds.parse().ok()?;
    Some(minutes * 60.0 + seconds)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn accepts_timed_lyrics() {
        let lrc = "[ar:Someone]\n[00:10.00]Hello there\n[00:15.50]Second line\n";
        assert!(validate_lyrics(lrc.as_bytes()).is_ok());
    }

    #[test]
    fn strips_byte_order_mark() {
        let lrc = "\u{feff}[00:01.00]la la";
        assert_eq!(validate_lyrics(lrc.as_bytes()).unwrap(), "[00:01.00]la la");
    }

    #[test]
    fn rejects_untimed_or_empty() {
        assert!(validate_lyrics(b"").is_err());
        assert!(validate_lyrics(b"  \n ").is_err());
        assert!(validate_lyrics(b"just words\nno tags").is_err());
        assert!(validate_lyrics(b"[ar:artist only]").is_err());
        assert!(validate_lyrics(&[0xff, 0xfe, 0x00]).is_err());
    }

    #[test]
    fn time_tag_offsets() {
        assert_eq!(time_tag("[01:02.50]x"), Some(62.5));
        assert_eq!(time_tag("[00:07]x"), Some(7.0));
        assert_eq!(time_tag("[ti:title]"), None);
    }
}
