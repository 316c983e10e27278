pub mod defs;

pub use defs::{
    is_valid_channel_name, Clip, ClipQuery, ClipQueryParams, DateWindow, PageResult, QueryError, SortMode,
    DATE_FORMAT, MAX_PAGE_SIZE,
};
