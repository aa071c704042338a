use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One independently checkpointed ingestion stream per remote resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Records,
    Bans,
    Servers,
    Maps,
    Players,
}

/// How a stream walks the remote collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// One GET per id; the cursor is the next id to fetch.
    ById,
    /// `limit`/`offset` pages; the cursor is the next offset.
    Paged,
}

impl StreamKind {
    pub const ALL: [StreamKind; 5] = [
        StreamKind::Records,
        StreamKind::Bans,
        StreamKind::Servers,
        StreamKind::Maps,
        StreamKind::Players,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Records => "records",
            StreamKind::Bans => "bans",
            StreamKind::Servers => "servers",
            StreamKind::Maps => "maps",
            StreamKind::Players => "players",
        }
    }

    /// Remote collection path relative to the API base.
    pub fn endpoint(self) -> &'static str {
        self.as_str()
    }

    pub fn fetch_mode(self) -> FetchMode {
        match self {
            StreamKind::Records => FetchMode::ById,
            _ => FetchMode::Paged,
        }
    }

    /// Cursor used when neither a checkpoint nor stored rows exist.
    pub fn initial_cursor(self) -> i64 {
        match self.fetch_mode() {
            FetchMode::ById => 1,
            FetchMode::Paged => 0,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_lowercase();
        StreamKind::ALL
            .into_iter()
            .find(|k| k.as_str() == norm || k.as_str().trim_end_matches('s') == norm)
            .ok_or_else(|| anyhow::anyhow!("unknown stream '{s}'"))
    }
}

/// The slice of the remote collection handled by one loop iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Window {
    /// Ids in `[start, end)`.
    Ids { start: i64, end: i64 },
    /// `pages` consecutive pages of `limit` rows starting at `offset`.
    Pages { offset: i64, limit: i64, pages: usize },
}

impl Window {
    /// Plan the window starting at `cursor`, never crossing `end_cursor`.
    pub fn plan(
        kind: StreamKind,
        cursor: i64,
        batch_size: usize,
        parallel_routes: usize,
        end_cursor: Option<i64>,
    ) -> Option<Window> {
        let batch = batch_size.max(1) as i64;
        if end_cursor.is_some_and(|end| cursor >= end) {
            return None;
        }
        match kind.fetch_mode() {
            FetchMode::ById => {
                let mut end = cursor.saturating_add(batch);
                if let Some(limit) = end_cursor {
                    end = end.min(limit);
                }
                Some(Window::Ids { start: cursor, end })
            }
            FetchMode::Paged => {
                let mut pages = parallel_routes.max(1);
                if let Some(limit) = end_cursor {
                    let remaining = (limit - cursor).max(0);
                    let needed = ((remaining + batch - 1) / batch) as usize;
                    pages = pages.min(needed.max(1));
                }
                Some(Window::Pages {
                    offset: cursor,
                    limit: batch,
                    pages,
                })
            }
        }
    }

    /// Cursor after the whole window has been committed.
    pub fn end_cursor(&self) -> i64 {
        match self {
            Window::Ids { end, .. } => *end,
            Window::Pages {
                offset,
                limit,
                pages,
            } => offset + limit * (*pages as i64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_singular_and_plural_names() {
        assert_eq!("records".parse::<StreamKind>().unwrap(), StreamKind::Records);
        assert_eq!("Ban".parse::<StreamKind>().unwrap(), StreamKind::Bans);
        assert!("jumpstats".parse::<StreamKind>().is_err());
    }

    #[test]
    fn id_window_is_clipped_to_final_cursor() {
        let w = Window::plan(StreamKind::Records, 95, 10, 1, Some(100)).unwrap();
        assert_eq!(w, Window::Ids { start: 95, end: 100 });
        assert_eq!(w.end_cursor(), 100);
        assert!(Window::plan(StreamKind::Records, 100, 10, 1, Some(100)).is_none());
    }

    #[test]
    fn paged_window_fans_out_one_page_per_route() {
        let w = Window::plan(StreamKind::Bans, 200, 100, 3, None).unwrap();
        assert_eq!(
            w,
            Window::Pages {
                offset: 200,
                limit: 100,
                pages: 3
            }
        );
        assert_eq!(w.end_cursor(), 500);

        let clipped = Window::plan(StreamKind::Bans, 200, 100, 3, Some(350)).unwrap();
        assert!(matches!(clipped, Window::Pages { pages: 2, .. }));
    }
}
