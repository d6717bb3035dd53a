use async_trait::async_trait;
use ferry_core::progress::{Notice, NoticeKind, Notifier};

/// Prints notices to stdout, one block per notice.
pub(crate) struct ConsoleNotifier {
    show_progress: bool,
}

impl ConsoleNotifier {
    pub(crate) fn new(show_progress: bool) -> Self {
        Self { show_progress }
    }
}

fn render(notice: &Notice) -> String {
    let mut out = format!("[#{} -> {}]", notice.request_id, notice.destination);
    for line in notice.text.lines() {
        out.push_str("\n  ");
        out.push_str(line);
    }
    out
}

fn headline(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn notify(&self, notice: Notice) {
        match notice.kind {
            NoticeKind::Progress => {
                log::debug!("request {} progress", notice.request_id);
                if !self.show_progress {
                    return;
                }
            }
            NoticeKind::Warning | NoticeKind::Failed => {
                log::warn!("request {}: {}", notice.request_id, headline(&notice.text))
            }
            NoticeKind::Info | NoticeKind::Completed => {}
        }
        println!("{}", render(&notice));
    }
}
