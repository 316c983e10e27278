use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Date format used by the `from`/`to` request parameters.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Largest page the upstream clip listing will hand out.
pub const MAX_PAGE_SIZE: u8 = 100;

/// One highlight clip, as produced by the page fetcher and sent over the wire.
///
/// `id` is unique per upstream item and is the only key consumers may rely on
/// when the same clip shows up twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    pub id: String,
    pub channel_id: String,
    pub channel_name: String,
    pub creator_name: String,
    pub title: String,
    pub url: String,
    pub embed_url: String,
    pub thumbnail_url: String,
    pub created_at: DateTime<Utc>,
    /// Seconds.
    pub duration: f64,
    pub view_count: u64,
    pub video_id: String,
    /// Seconds into the source video, when the upstream still knows it.
    pub vod_offset: Option<u64>,
    pub category_id: String,
}

/// A single page of clips for one channel. Never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageResult {
    pub clips: Vec<Clip>,
    pub next_cursor: Option<String>,
}

impl PageResult {
    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }

    /// View count of the weakest clip, assuming the page is ordered by views.
    pub fn last_view_count(&self) -> Option<u64> {
        self.clips.last().map(|clip| clip.view_count)
    }

    pub fn first_view_count(&self) -> Option<u64> {
        self.clips.first().map(|clip| clip.view_count)
    }

    /// True when view counts never increase from one clip to the next.
    pub fn is_descending_by_views(&self) -> bool {
        self.clips
            .windows(2)
            .all(|pair| pair[0].view_count >= pair[1].view_count)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortMode {
    /// Most viewed first.
    #[default]
    Views,
    /// Most recent first.
    Newest,
    /// Oldest first.
    Oldest,
}

impl std::str::FromStr for SortMode {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "views" | "top" => Ok(SortMode::Views),
            "newest" | "desc" => Ok(SortMode::Newest),
            "oldest" | "asc" => Ok(SortMode::Oldest),
            other => Err(QueryError::InvalidSort(other.to_string())),
        }
    }
}

/// Inclusive date range of a query, expanded to upstream timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl DateWindow {
    pub fn from_dates(from: NaiveDate, to: NaiveDate) -> Result<Self, QueryError> {
        if from > to {
            return Err(QueryError::InvertedRange { from, to });
        }
        Ok(Self::spanning(from, to))
    }

    /// From midnight on `from` through the last second of `to`.
    fn spanning(from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            started_at: Utc.from_utc_datetime(&from.and_time(NaiveTime::MIN)),
            ended_at: Utc.from_utc_datetime(&to.and_time(NaiveTime::MIN)) + Duration::seconds(86_399),
        }
    }
}

/// A validated clip query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipQuery {
    /// Requested channel names, as given. Invalid names are kept here and
    /// dropped by the aggregator, never reported as errors.
    pub channels: Vec<String>,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub min_views: u64,
}

impl ClipQuery {
    pub fn new(channels: Vec<String>, from: NaiveDate, to: NaiveDate, min_views: u64) -> Result<Self, QueryError> {
        DateWindow::from_dates(from, to)?;
        Ok(Self {
            channels,
            from,
            to,
            min_views,
        })
    }

    pub fn window(&self) -> DateWindow {
        DateWindow::spanning(self.from, self.to)
    }

    /// Channel names that pass validation, lowercased and de-duplicated in
    /// request order.
    pub fn valid_channels(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for name in &self.channels {
            let name = name.trim();
            if !is_valid_channel_name(name) {
                continue;
            }
            let name = name.to_ascii_lowercase();
            if !seen.contains(&name) {
                seen.push(name);
            }
        }
        seen
    }

    pub fn to_params(&self) -> ClipQueryParams {
        ClipQueryParams {
            channels: self.channels.join(","),
            from: self.from.format(DATE_FORMAT).to_string(),
            to: self.to.format(DATE_FORMAT).to_string(),
            min_views: Some(self.min_views.to_string()),
        }
    }
}

/// Query-string form of [`ClipQuery`]:
/// `channels=a,b&from=yyyy-MM-dd&to=yyyy-MM-dd&minViews=N`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipQueryParams {
    #[serde(default)]
    pub channels: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_views: Option<String>,
}

impl TryFrom<ClipQueryParams> for ClipQuery {
    type Error = QueryError;

    fn try_from(params: ClipQueryParams) -> Result<Self, Self::Error> {
        let from = parse_date(&params.from)?;
        let to = parse_date(&params.to)?;
        let min_views = match params.min_views.as_deref().map(str::trim) {
            None | Some("") => 0,
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| QueryError::InvalidMinViews(raw.to_string()))?,
        };
        let channels = params
            .channels
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        ClipQuery::new(channels, from, to, min_views)
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, QueryError> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).map_err(|_| QueryError::InvalidDate(raw.to_string()))
}

/// Channel names follow `^[A-Za-z0-9][A-Za-z0-9_]{2,24}$`.
pub fn is_valid_channel_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if !(3..=25).contains(&bytes.len()) {
        return false;
    }
    bytes[0].is_ascii_alphanumeric()
        && bytes[1..]
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'_')
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("invalid date '{0}', expected yyyy-MM-dd")]
    InvalidDate(String),

    #[error("date range is inverted: {from} is after {to}")]
    InvertedRange { from: NaiveDate, to: NaiveDate },

    #[error("invalid minViews '{0}', expected a non-negative integer")]
    InvalidMinViews(String),

    #[error("unknown sort mode '{0}'")]
    InvalidSort(String),
}
