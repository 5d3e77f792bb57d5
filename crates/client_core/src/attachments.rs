use shared::domain::FileId;

pub const FILE_ID_MARKER: &str = "[fileid]";
pub const LEGACY_URL_MARKER: &str = "[file]";

const GENERIC_DOWNLOAD_LABEL: &str = "Download file";

/// A parsed pointer to an uploaded file, embedded in or alongside a message
/// body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentRef {
    /// Current form: the file lives behind a server-side id.
    IdRef {
        file_id: FileId,
        filetype: Option<String>,
        filename: Option<String>,
    },
    /// Older messages carried a raw url instead of an id.
    LegacyUrlRef {
        url: String,
        filetype: Option<String>,
        filename: Option<String>,
    },
}

impl AttachmentRef {
    pub fn display_name(&self) -> &str {
        let filename = match self {
            AttachmentRef::IdRef { filename, .. } | AttachmentRef::LegacyUrlRef { filename, .. } => {
                filename
            }
        };
        filename
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(GENERIC_DOWNLOAD_LABEL)
    }
}

/// Combined decode: structured fields win over body sniffing, matching the
/// wire precedence.
pub fn decode(
    body: &str,
    file_id: Option<FileId>,
    filetype: Option<&str>,
    filename: Option<&str>,
) -> Option<AttachmentRef> {
    decode_fields(file_id, filetype, filename).or_else(|| decode_body(body))
}

pub fn decode_fields(
    file_id: Option<FileId>,
    filetype: Option<&str>,
    filename: Option<&str>,
) -> Option<AttachmentRef> {
    file_id.map(|file_id| AttachmentRef::IdRef {
        file_id,
        filetype: filetype.map(str::to_string),
        filename: filename.map(str::to_string),
    })
}

/// Lenient: anything unrecognized, including an id that does not parse, is
/// treated as plain text. Never fails.
pub fn decode_body(body: &str) -> Option<AttachmentRef> {
    if let Some(rest) = body.strip_prefix(FILE_ID_MARKER) {
        let (id, filetype, filename) = split_payload(rest);
        let file_id = id.parse::<i64>().ok().map(FileId)?;
        return Some(AttachmentRef::IdRef {
            file_id,
            filetype,
            filename,
        });
    }

    if let Some(rest) = body.strip_prefix(LEGACY_URL_MARKER) {
        let (url, filetype, filename) = split_payload(rest);
        if url.is_empty() {
            return None;
        }
        return Some(AttachmentRef::LegacyUrlRef {
            url: url.to_string(),
            filetype,
            filename,
        });
    }

    None
}

/// Marker-prefixed body form, the only encoding group frames can carry.
pub fn encode(attachment: &AttachmentRef) -> String {
    match attachment {
        AttachmentRef::IdRef {
            file_id,
            filetype,
            filename,
        } => format!(
            "{FILE_ID_MARKER}{}|{}|{}",
            file_id.0,
            filetype.as_deref().unwrap_or_default(),
            filename.as_deref().unwrap_or_default()
        ),
        AttachmentRef::LegacyUrlRef {
            url,
            filetype,
            filename,
        } => format!(
            "{LEGACY_URL_MARKER}{url}|{}|{}",
            filetype.as_deref().unwrap_or_default(),
            filename.as_deref().unwrap_or_default()
        ),
    }
}

fn split_payload(rest: &str) -> (&str, Option<String>, Option<String>) {
    let mut parts = rest.splitn(3, '|');
    let head = parts.next().unwrap_or_default();
    let filetype = parts
        .next()
        .filter(|part| !part.is_empty())
        .map(str::to_string);
    let filename = parts
        .next()
        .filter(|part| !part.is_empty())
        .map(str::to_string);
    (head, filetype, filename)
}
