//! Content-type detection from leading payload bytes.

pub const GENERIC_BINARY: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Png,
    Jpeg,
    Bmp,
    Gif,
    Wma,
    Wav,
    Amr,
    Mp3,
    Mp4,
}

impl MediaKind {
    pub fn mime(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Bmp => "image/bmp",
            Self::Gif => "image/gif",
            Self::Wma => "audio/x-ms-wma",
            Self::Wav => "audio/wav",
            Self::Amr => "audio/amr",
            Self::Mp3 => "audio/mpeg",
            Self::Mp4 => "video/mp4",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Bmp => "bmp",
            Self::Gif => "gif",
            Self::Wma => "wma",
            Self::Wav => "wav",
            Self::Amr => "amr",
            Self::Mp3 => "mp3",
            Self::Mp4 => "mp4",
        }
    }
}

// (offset, signature, kind), checked in order.
const MAGIC: &[(usize, &[u8], MediaKind)] = &[
    (0, b"\x89PNG\r\n\x1a\n", MediaKind::Png),
    (0, b"\xFF\xD8\xFF", MediaKind::Jpeg),
    (0, b"GIF87a", MediaKind::Gif),
    (0, b"GIF89a", MediaKind::Gif),
    (
        0,
        b"\x30\x26\xB2\x75\x8E\x66\xCF\x11",
        MediaKind::Wma,
    ),
    (0, b"#!AMR", MediaKind::Amr),
    (0, b"ID3", MediaKind::Mp3),
    (4, b"ftyp", MediaKind::Mp4),
];

fn has_signature(payload: &[u8], offset: usize, signature: &[u8]) -> bool {
    payload
        .get(offset..offset + signature.len())
        .is_some_and(|window| window == signature)
}

pub fn sniff(payload: &[u8]) -> Option<MediaKind> {
    if has_signature(payload, 0, b"RIFF") && has_signature(payload, 8, b"WAVE") {
        return Some(MediaKind::Wav);
    }
    // "BM" alone is too common in text; the header's reserved words are zero.
    if has_signature(payload, 0, b"BM") && has_signature(payload, 6, &[0; 4]) {
        return Some(MediaKind::Bmp);
    }

    if let Some((_, _, kind)) = MAGIC
        .iter()
        .find(|(offset, signature, _)| has_signature(payload, *offset, signature))
    {
        return Some(*kind);
    }

    // Bare MPEG audio frame: 11 sync bits set.
    match payload {
        [0xFF, second, ..] if second & 0xE0 == 0xE0 => Some(MediaKind::Mp3),
        _ => None,
    }
}

pub fn sniff_mime(payload: &[u8]) -> &'static str {
    sniff(payload).map_or(GENERIC_BINARY, MediaKind::mime)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_tail(head: &[u8]) -> Vec<u8> {
        let mut payload = head.to_vec();
        payload.extend_from_slice(&[0u8; 32]);
        payload
    }

    #[test]
    fn recognizes_each_signature() {
        let cases: &[(&[u8], &str)] = &[
            (b"\x89PNG\r\n\x1a\n", "image/png"),
            (b"\xFF\xD8\xFF\xE0", "image/jpeg"),
            (b"BM\x36\x00\x0C\x00\x00\x00\x00\x00\x36\x00", "image/bmp"),
            (b"GIF87a", "image/gif"),
            (b"GIF89a", "image/gif"),
            (b"ID3\x04\x00", "audio/mpeg"),
            (b"\xFF\xFB\x90\x64", "audio/mpeg"),
            (b"\x00\x00\x00\x18ftypmp42", "video/mp4"),
            (b"#!AMR\n", "audio/amr"),
            (b"RIFF\x24\x08\x00\x00WAVEfmt ", "audio/wav"),
            (b"\x30\x26\xB2\x75\x8E\x66\xCF\x11", "audio/x-ms-wma"),
        ];
        for (head, expected) in cases {
            assert_eq!(sniff_mime(&with_tail(head)), *expected, "head {head:02x?}");
        }
    }

    #[test]
    fn unknown_and_short_payloads_fall_back_to_binary() {
        assert_eq!(sniff_mime(b"plain text body"), GENERIC_BINARY);
        assert_eq!(sniff_mime(b""), GENERIC_BINARY);
        assert_eq!(sniff_mime(b"\x89PN"), GENERIC_BINARY);
        assert_eq!(sniff_mime(b"RIFF\x00\x00\x00\x00AVI "), GENERIC_BINARY);
    }

    #[test]
    fn bmp_needs_zeroed_reserved_header_words() {
        assert_eq!(sniff(b"BMW owners club newsletter"), None);
        assert_eq!(sniff(b"BM\x36\x00\x0C\x00\x01\x00\x00\x00"), None);
        assert_eq!(sniff(b"BM\x36\x00"), None);
        assert_eq!(
            sniff(b"BM\x36\x00\x0C\x00\x00\x00\x00\x00\x36\x00\x00\x00"),
            Some(MediaKind::Bmp)
        );
    }

    #[test]
    fn jpeg_is_not_mistaken_for_mpeg_frame() {
        assert_eq!(sniff(b"\xFF\xD8\xFF\xDB"), Some(MediaKind::Jpeg));
        assert_eq!(sniff(b"\xFF\xD8"), None);
    }

    #[test]
    fn extensions_follow_kind() {
        assert_eq!(MediaKind::Jpeg.extension(), "jpg");
        assert_eq!(MediaKind::Mp4.extension(), "mp4");
    }
}
