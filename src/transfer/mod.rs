//! Background transfer capability.
//!
//! The registry only sees [`TransferHandle`]s and [`TransferEvent`]s; the
//! [`http`] facility is the implementation that actually moves bytes.

pub mod description;
pub mod facility;
pub mod handle;
pub mod http;
pub mod resume;

pub use description::{DescriptionError, TaskDescription};
pub use facility::{
    FacilityError, InterruptReason, TransferError, TransferErrorKind, TransferEvent,
    TransferFacility,
};
pub use handle::{HandleError, Transfer, TransferHandle, TransferId, TransferState};
pub use http::HttpFacility;
pub use resume::{ResumeError, ResumeInfo, ResumeToken, ResumeTokenValidator};
