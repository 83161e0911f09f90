//! Report model and backend access
//!
//! - `types`: reports, patches, filters, statistics
//! - `store`: the `ReportStore` trait and its REST implementation

mod store;
mod types;

pub use store::{HttpReportStore, ReportStore};
pub use types::{
    ApprovalRequest, DeclineRequest, Paginated, Pagination, Report, ReportFilters, ReportPatch,
    ReportStatistics, ReportStatus, StatisticsFilters,
};
