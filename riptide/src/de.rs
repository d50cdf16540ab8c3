use serde::{de, Deserialize};
use url::Url;

// Deserialiser functions for metainfo.

// Torrent strings are supposed to be UTF-8, but non-compliant files exist.
// Invalid sequences are taken as ISO 8859-1 and converted byte-for-byte.
pub fn to_utf8(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(s) => {
                out.push_str(s);
                return out;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                // The prefix was just checked.
                out.push_str(std::str::from_utf8(valid).unwrap());
                out.push(after[0] as char);
                rest = &after[1..];
            }
        }
    }
}

pub fn url_deserialize<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Url::parse(&s).map_err(de::Error::custom)
}

pub fn opt_string_deserialize<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let raw = Option::<serde_bytes::ByteBuf>::deserialize(deserializer)?;
    Ok(raw.map(|b| to_utf8(&b)))
}
