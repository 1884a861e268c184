//! Data models for turnledger

pub mod ids;
pub mod message;
pub mod range;
pub mod report;
pub mod usage;

pub use ids::{ChannelId, CustomerId, IdValue, SessionId};
pub use message::{CreatorRole, Message, RoleSets};
pub use range::{DateRange, EndBound, SortOrder};
pub use report::{
    round2, round3, Feedback, MatchSource, ReportPage, ReportRow, ReportSummary, RowKey,
};
pub use usage::{ModelTimeline, ModelTimelineEntry, UsageRecord};
