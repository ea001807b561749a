//! Filename charset conversion.
//!
//! Servers that predate `OPTS UTF8 ON` speak a fixed codepage on the wire
//! while the local side wants the mount's I/O charset. Listing names are
//! decoded remote→local; rename arguments are converted local→remote when
//! the result is still representable on the typed control channel.

use std::borrow::Cow;

use encoding_rs::Encoding;
use log::warn;

/// Converter between the remote codepage and the local I/O charset.
#[derive(Debug, Clone, Copy)]
pub struct CodepageConv {
    remote: &'static Encoding,
    local: &'static Encoding,
}

impl CodepageConv {
    /// Build a converter from charset labels (`cp1251`, `latin1`, `utf-8`, ...).
    ///
    /// Returns `None` when a label is unknown to the encoding table.
    pub fn new(codepage: &str, iocharset: &str) -> Option<Self> {
        let remote = Encoding::for_label(codepage.as_bytes())?;
        let local = Encoding::for_label(iocharset.as_bytes())?;
        Some(CodepageConv { remote, local })
    }

    /// Decode a name received from the server into the local charset.
    pub fn to_local(&self, raw: &[u8]) -> String {
        let (unicode, _, _) = self.remote.decode(raw);
        if self.local == encoding_rs::UTF_8 {
            return unicode.into_owned();
        }
        let (encoded, _, _) = self.local.encode(&unicode);
        String::from_utf8_lossy(&encoded).into_owned()
    }

    /// Convert a local name for the wire.
    ///
    /// The control channel carries commands as strings, so a conversion whose
    /// codepage form is not valid UTF-8 cannot be expressed; the name is then
    /// sent unconverted and the degradation is logged once per call site.
    pub fn to_remote<'a>(&self, name: &'a str) -> Cow<'a, str> {
        let (decoded, _, _) = self.local.decode(name.as_bytes());
        let (encoded, _, unmappable) = self.remote.encode(&decoded);
        if unmappable {
            warn!("charset: {name:?} has no representation in the remote codepage");
            return Cow::Borrowed(name);
        }
        match std::str::from_utf8(&encoded) {
            Ok(s) if s == name => Cow::Borrowed(name),
            Ok(s) => Cow::Owned(s.to_string()),
            Err(_) => {
                warn!("charset: converted form of {name:?} is not transportable, sending as-is");
                Cow::Borrowed(name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_label_is_rejected() {
        assert!(CodepageConv::new("not-a-charset", "utf-8").is_none());
        assert!(CodepageConv::new("cp1251", "bogus").is_none());
    }

    #[test]
    fn decodes_cp1251_listing_name() {
        let conv = CodepageConv::new("cp1251", "utf-8").unwrap();
        // "тест" in cp1251
        assert_eq!(conv.to_local(&[0xf2, 0xe5, 0xf1, 0xf2]), "тест");
    }

    #[test]
    fn ascii_passes_through_unchanged() {
        let conv = CodepageConv::new("cp1251", "utf-8").unwrap();
        assert_eq!(conv.to_local(b"readme.txt"), "readme.txt");
        assert!(matches!(conv.to_remote("readme.txt"), Cow::Borrowed(_)));
    }

    #[test]
    fn untransportable_name_falls_back() {
        let conv = CodepageConv::new("cp1251", "utf-8").unwrap();
        // Cyrillic encodes to cp1251 bytes that are not valid UTF-8.
        let out = conv.to_remote("тест");
        assert_eq!(out, "тест");
    }

    #[test]
    fn latin1_round_trip() {
        let conv = CodepageConv::new("latin1", "utf-8").unwrap();
        assert_eq!(conv.to_local(&[0xe9, 0x74, 0xe9]), "été");
    }
}
