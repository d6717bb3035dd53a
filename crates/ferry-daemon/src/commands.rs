use ferry_core::model::RequestId;
use ferry_core::source::FolderLink;

pub(crate) const WELCOME: &str = "👋 Welcome to ferry!\n\n\
Send me a shared folder link and I will download it, pack it into \
compressed chunks and deliver them here.\n\n\
Commands:\n\
/download <link> - start a download\n\
/status - show your active downloads\n\
/cancel [id] - cancel a download (newest when no id is given)\n\
/resume <id> - resume a paused or failed download\n\
/help - show this message";

pub(crate) const HELP: &str = "📖 How it works\n\n\
1. Send /download <link> or paste a folder link.\n\
2. Files are grouped into chunks and compressed as .tar.zst.\n\
3. Chunks larger than the upload limit arrive as numbered parts; \
join them in order before extracting.\n\
4. When the source runs out of bandwidth the download pauses; \
/resume <id> picks it up where it stopped.";

/// A line of operator input, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Start,
    Help,
    Download(String),
    Status,
    Cancel(Option<RequestId>),
    Resume(RequestId),
    /// A known command with unusable arguments; carries the usage hint.
    Usage(&'static str),
    Unknown(String),
    Empty,
}

impl Command {
    pub(crate) fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let word = word.strip_prefix('/').unwrap_or(word).to_ascii_lowercase();
        match word.as_str() {
            "start" => Self::Start,
            "help" => Self::Help,
            "status" => Self::Status,
            "download" => match rest.split_whitespace().next() {
                Some(link) => Self::Download(link.to_string()),
                None => Self::Usage("Usage: /download <link>"),
            },
            "cancel" => match rest.split_whitespace().next() {
                None => Self::Cancel(None),
                Some(id) => match parse_id(id) {
                    Some(id) => Self::Cancel(Some(id)),
                    None => Self::Usage("Usage: /cancel [id]"),
                },
            },
            "resume" => match rest.split_whitespace().next().and_then(parse_id) {
                Some(id) => Self::Resume(id),
                None => Self::Usage("Usage: /resume <id>"),
            },
            _ => match FolderLink::find_in(line) {
                Some(link) => Self::Download(link.canonical()),
                None => Self::Unknown(line.to_string()),
            },
        }
    }
}

fn parse_id(raw: &str) -> Option<RequestId> {
    raw.trim_start_matches('#').parse().ok()
}
