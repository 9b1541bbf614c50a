mod cutoff;
mod staging;
mod target;

pub use cutoff::{extract_cutoff, PriorBackup};
pub use staging::{
    read_staging, write_call_staging, write_message_staging, StagingRow, StagingSummary,
    StagingTable, CALL_STAGING_HEADER, MESSAGE_STAGING_HEADER, UNKNOWN_CONTACT,
};
pub use target::{
    call_elements, message_elements, write_target_document, TargetElement, TargetKind,
    TargetSummary,
};
