use std::fmt;

use url::Url;

use crate::errors::{TransferError, TransferResult};

/// Which of the accepted URL shapes a link was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkShape {
    /// `mega.nz/folder/<id>#<key>`
    Folder,
    /// `mega.nz/#F!<id>!<key>`
    Legacy,
    /// `mega.co.nz/#F!<id>!<key>`
    LegacyCoNz,
}

/// A shared-folder reference: folder id plus decryption key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderLink {
    pub folder_id: String,
    pub key: String,
    pub shape: LinkShape,
}

impl FolderLink {
    pub fn parse(input: &str) -> TransferResult<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(TransferError::validation("empty folder link"));
        }
        let candidate = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("https://{trimmed}")
        };
        let url = Url::parse(&candidate)
            .map_err(|err| TransferError::validation(format!("invalid folder link: {err}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(input));
        }
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        let host = host.strip_prefix("www.").unwrap_or(&host);
        let fragment = url.fragment().unwrap_or_default();

        match host {
            "mega.nz" => {
                let mut segments = url.path_segments().into_iter().flatten();
                match (segments.next(), segments.next()) {
                    (Some("folder"), Some(id)) if !id.is_empty() => {
                        let key = fragment.split('/').next().unwrap_or_default();
                        if key.is_empty() {
                            return Err(invalid(input));
                        }
                        Ok(Self {
                            folder_id: id.to_string(),
                            key: key.to_string(),
                            shape: LinkShape::Folder,
                        })
                    }
                    _ => parse_legacy(input, fragment, LinkShape::Legacy),
                }
            }
            "mega.co.nz" => parse_legacy(input, fragment, LinkShape::LegacyCoNz),
            _ => Err(invalid(input)),
        }
    }

    /// First folder link found in free text, if any.
    pub fn find_in(text: &str) -> Option<Self> {
        text.split_whitespace()
            .filter(|word| word.contains("mega.nz") || word.contains("mega.co.nz"))
            .find_map(|word| Self::parse(word.trim_matches(is_wrapping)).ok())
    }

    /// Link in the current URL shape.
    pub fn canonical(&self) -> String {
        format!("https://mega.nz/folder/{}#{}", self.folder_id, self.key)
    }
}

impl fmt::Display for FolderLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

fn is_wrapping(c: char) -> bool {
    matches!(
        c,
        '<' | '>' | '(' | ')' | '.' | ',' | ';' | '!' | '?' | '"' | '\''
    )
}

fn parse_legacy(input: &str, fragment: &str, shape: LinkShape) -> TransferResult<FolderLink> {
    let rest = fragment.strip_prefix("F!").ok_or_else(|| invalid(input))?;
    let (id, key) = rest.split_once('!').ok_or_else(|| invalid(input))?;
    let key = key.split('/').next().unwrap_or_default();
    if id.is_empty() || key.is_empty() {
        return Err(invalid(input));
    }
    Ok(FolderLink {
        folder_id: id.to_string(),
        key: key.to_string(),
        shape,
    })
}

fn invalid(input: &str) -> TransferError {
    TransferError::validation(format!("not a shared folder link: {}", input.trim()))
}
