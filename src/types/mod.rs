//! Type definitions for the churn pipeline

pub mod events;
pub mod member;
pub mod report;

pub use events::{BatchOperation, ChurnAnalysisRequest, CheckinBatch, CheckinEntry, DailyReportRequest};
pub use member::{CheckinEvent, EnrollmentStatus, Member};
pub use report::{DailyReport, ReportPeriod, ReportRecord};
