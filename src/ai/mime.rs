use base64::Engine as _;

pub const IMAGE_MIME_PREFIX: &str = "image/";
pub const AUDIO_MIME_PREFIX: &str = "audio/";

/// Sniff the content type of an attachment from its leading bytes.
pub fn detect_mime(bytes: &[u8]) -> Option<&'static str> {
    let mime = match bytes {
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [0x89, 0x50, 0x4E, 0x47, ..] => "image/png",
        [0x47, 0x49, 0x46, 0x38, ..] => "image/gif",
        [0x52, 0x49, 0x46, 0x46, _, _, _, _, 0x57, 0x45, 0x42, 0x50, ..] => "image/webp",
        [0x52, 0x49, 0x46, 0x46, _, _, _, _, 0x57, 0x41, 0x56, 0x45, ..] => "audio/wave",
        [0x49, 0x44, 0x33, ..] => "audio/mpeg",
        [0xFF, second, ..] if second & 0xE0 == 0xE0 => "audio/mpeg",
        [0x4F, 0x67, 0x67, 0x53, ..] => "audio/ogg",
        [0x66, 0x4C, 0x61, 0x43, ..] => "audio/flac",
        [_, _, _, _, 0x66, 0x74, 0x79, 0x70, 0x4D, 0x34, 0x41, ..] => "audio/mp4",
        _ => {
            tracing::debug!(
                "Unrecognized attachment format (first 4 bytes: {:02X?})",
                &bytes[..bytes.len().min(4)]
            );
            return None;
        }
    };
    Some(mime)
}

/// Encode bytes as a `data:` URL for inline image parts.
pub fn data_url(mime: &str, bytes: &[u8]) -> String {
    let payload = base64::engine::general_purpose::STANDARD.encode(bytes);
    format!("data:{};base64,{}", mime, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_png() {
        assert_eq!(
            detect_mime(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A]),
            Some("image/png")
        );
    }

    #[test]
    fn test_detect_jpeg() {
        assert_eq!(detect_mime(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
    }

    #[test]
    fn test_detect_webp_and_wav_share_riff() {
        assert_eq!(
            detect_mime(&[
                0x52, 0x49, 0x46, 0x46, 0x00, 0x00, 0x00, 0x00, 0x57, 0x45, 0x42, 0x50
            ]),
            Some("image/webp")
        );
        assert_eq!(
            detect_mime(&[
                0x52, 0x49, 0x46, 0x46, 0x00, 0x00, 0x00, 0x00, 0x57, 0x41, 0x56, 0x45
            ]),
            Some("audio/wave")
        );
    }

    #[test]
    fn test_detect_mp3() {
        assert_eq!(detect_mime(b"ID3\x04\x00"), Some("audio/mpeg"));
        assert_eq!(detect_mime(&[0xFF, 0xFB, 0x90, 0x64]), Some("audio/mpeg"));
    }

    #[test]
    fn test_unknown_is_none() {
        assert_eq!(detect_mime(b"hello world"), None);
        assert_eq!(detect_mime(&[]), None);
    }

    #[test]
    fn test_data_url() {
        assert_eq!(data_url("image/png", &[0x89, 0x50]), "data:image/png;base64,iVA=");
    }
}
