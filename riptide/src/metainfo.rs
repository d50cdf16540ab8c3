use serde_derive::{Deserialize, Serialize};
use crate::{de, store::FileInfo, ID};

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("invalid pieces length, must be divisible by 20")]
    InvalidPiecesLength,

    #[error("invalid piece length")]
    InvalidPieceLength,

    #[error("announce url is not http")]
    NonHttpAnnounce,

    #[error("metainfo has neither a files list nor a length")]
    NoFiles,

    #[error("could not locate the info dictionary")]
    NoInfoDict,

    #[error("file(s) with no path")]
    FileEmptyPath,

    #[error("file has absolute path")]
    FileAbsolutePath,

    #[error("piece count does not match total size")]
    PieceCountMismatch,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {

    // One or more byte-string elements that together form the relative path.
    pub path: Vec<serde_bytes::ByteBuf>,

    pub length: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<serde_bytes::ByteBuf>,

}

// The info sub-dictionary. Kept byte-for-byte round-trippable: the info-hash
// is the SHA-1 of its re-serialised bencode, so string fields stay raw here
// and are transcoded only at the accessors.
#[derive(Clone, Deserialize, Serialize)]
pub struct Info {

    // File (single-file mode) or directory (multi-file mode) name.
    pub name: serde_bytes::ByteBuf,

    // Concatenation of all 20-byte SHA-1 piece hashes.
    pub pieces: serde_bytes::ByteBuf,

    // Number of bytes in each piece.
    #[serde(rename = "piece length")]
    pub piece_length: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<serde_bytes::ByteBuf>,

    // Length of the file in bytes, single-file mode only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,

    // A list of dictionaries, one per file, multi-file mode only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde(rename = "root hash")]
    pub root_hash: Option<serde_bytes::ByteBuf>,

}

#[derive(Clone, Deserialize)]
pub struct MetaInfo {

    // The announce URL of the tracker.
    #[serde(deserialize_with = "crate::de::url_deserialize")]
    pub announce: url::Url,

    pub info: Info,

    #[serde(skip)]
    info_hash: ID,

    #[serde(default, deserialize_with = "crate::de::opt_string_deserialize")]
    pub encoding: Option<String>,

    #[serde(default)]
    #[serde(rename = "creation date")]
    pub creation_date: Option<i64>,

    #[serde(default, deserialize_with = "crate::de::opt_string_deserialize")]
    pub comment: Option<String>,

    #[serde(default, deserialize_with = "crate::de::opt_string_deserialize")]
    #[serde(rename = "created by")]
    pub created_by: Option<String>,

}

impl MetaInfo {

    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Result<MetaInfo, MetaInfoError> {

        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }

        let data = std::fs::read(path)?;
        let mut metainfo: MetaInfo = serde_bencode::from_bytes(&data)?;

        if metainfo.info.pieces.len() % 20 != 0 || metainfo.info.pieces.is_empty() {
            return Err(MetaInfoError::InvalidPiecesLength);
        }
        if metainfo.info.piece_length == 0 {
            return Err(MetaInfoError::InvalidPieceLength);
        }
        if metainfo.announce.scheme() != "http" {
            return Err(MetaInfoError::NonHttpAnnounce);
        }
        if metainfo.info.files.is_none() && metainfo.info.length.is_none() {
            return Err(MetaInfoError::NoFiles);
        }
        if let Some(files) = &metainfo.info.files {
            for file in files {
                if file.path.is_empty() || file.path.iter().any(|p| p.is_empty()) {
                    return Err(MetaInfoError::FileEmptyPath);
                }
                if file.path[0].starts_with(b"/") {
                    return Err(MetaInfoError::FileAbsolutePath);
                }
            }
        }

        // The "pieces" table and the file sizes must describe the same length.
        let piece_len = metainfo.info.piece_length as u64;
        let expected = (metainfo.total_len() + piece_len - 1) / piece_len;
        if metainfo.num_pieces() as u64 != expected {
            return Err(MetaInfoError::PieceCountMismatch);
        }

        // The info-hash is the SHA-1 of the info value exactly as it appears
        // in the file. Re-encoding would silently change it for any torrent
        // with non-canonical bencode or keys this struct doesn't carry.
        let span = info_span(&data).ok_or(MetaInfoError::NoInfoDict)?;
        use sha1::Digest;
        let mut hasher = sha1::Sha1::new();
        hasher.update(&data[span]);
        metainfo.info_hash = hasher.finalize().into();

        tracing::debug!("metainfo created: {:#?}", metainfo);
        Ok(metainfo)
    }

    pub fn piece_hashes(&self) -> Vec<ID> {
        self.info.pieces
            .chunks_exact(20)
            // Safe as we have already checked length is a multiple of 20, in new.
            .map(|c| c.try_into().unwrap())
            .collect()
    }

    pub fn piece_len(&self) -> usize { self.info.piece_length as usize }

    pub fn num_pieces(&self) -> usize { self.info.pieces.len() / 20 }

    pub fn is_multi_file(&self) -> bool { self.info.files.is_some() }

    pub fn total_len(&self) -> u64 {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| f.length).sum()
        } else {
            self.info.length.unwrap_or(0)
        }
    }

    pub fn info_hash(&self) -> ID { self.info_hash }

    pub fn name(&self) -> String { de::to_utf8(&self.info.name) }

    pub fn tracker_host(&self) -> &str {
        self.announce.host_str().unwrap_or_default()
    }

    pub fn tracker_port(&self) -> u16 {
        self.announce.port_or_known_default().unwrap_or(80)
    }

    pub fn files(&self) -> Vec<FileInfo> {
        if let Some(files) = &self.info.files {
            let mut offset = 0;
            files.iter().map(|f| {
                let file_info = FileInfo {
                    path: f.path.iter().map(|p| de::to_utf8(p)).collect(),
                    length: f.length as usize,
                    offset,
                };
                offset += f.length as usize;
                file_info
            }).collect()
        } else {
            vec![FileInfo {
                path: self.name().into(),
                length: self.total_len() as usize,
                offset: 0,
            }]
        }
    }

    // Formatting methods.

    pub fn creation_date_fmt(&self) -> Option<String> {
        self.creation_date.map(|v| {
            let date = chrono::NaiveDateTime::from_timestamp_opt(v, 0);
            date.map(|v| v.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "Invalid date".to_string())
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn size_fmt(&self) -> String {
        format_size(self.total_len())
    }
}

// Walks the top-level dictionary and returns the byte span of the "info"
// value, verbatim. Every other client hashes these exact bytes, so no
// round trip through our own types may touch them.
fn info_span(buf: &[u8]) -> Option<std::ops::Range<usize>> {
    if buf.first() != Some(&b'd') {
        return None;
    }
    let mut pos = 1;
    while *buf.get(pos)? != b'e' {
        let (key, value_start) = parse_string(buf, pos)?;
        let value_end = skip_value(buf, value_start)?;
        if key == b"info" {
            return Some(value_start..value_end);
        }
        pos = value_end;
    }
    None
}

fn parse_string(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let colon = buf[pos..].iter().position(|&b| b == b':')? + pos;
    let len: usize = std::str::from_utf8(&buf[pos..colon]).ok()?.parse().ok()?;
    let start = colon + 1;
    let end = start.checked_add(len)?;
    if end > buf.len() {
        return None;
    }
    Some((&buf[start..end], end))
}

// Returns the position just past the bencode value starting at `pos`.
fn skip_value(buf: &[u8], pos: usize) -> Option<usize> {
    match buf.get(pos)? {
        b'i' => {
            let end = buf[pos..].iter().position(|&b| b == b'e')? + pos;
            Some(end + 1)
        }
        // Dictionaries are just lists of alternating key and value here.
        b'l' | b'd' => {
            let mut pos = pos + 1;
            while *buf.get(pos)? != b'e' {
                pos = skip_value(buf, pos)?;
            }
            Some(pos + 1)
        }
        b'0'..=b'9' => parse_string(buf, pos).map(|(_, end)| end),
        _ => None,
    }
}

fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    let mut unit = "B";
    if size > 1024.0 {
        size /= 1024.0;
        unit = "KiB";
    }
    if size > 1024.0 {
        size /= 1024.0;
        unit = "MiB";
    }
    if size > 1024.0 {
        size /= 1024.0;
        unit = "GiB";
    }
    if size > 1024.0 {
        size /= 1024.0;
        unit = "TiB";
    }
    format!("{:.2} {}", size, unit)
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("announce", &self.announce.as_str())
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .field("encoding", &self.encoding)
            .field("creation_date", &self.creation_date_fmt())
            .field("comment", &self.comment)
            .field("created_by", &self.created_by)
            .finish()
    }
}

// Dont want to print out the pieces field, so we implement Debug manually.
impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &crate::de::to_utf8(&self.name))
            .field("num pieces", &(self.pieces.len() / 20))
            .field("piece_length", &self.piece_length)
            .field("length", &self.length)
            .field("files", &self.files)
            .field("private", &self.private)
            .finish()
    }
}
