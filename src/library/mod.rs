mod reconciler;
mod scanner;
mod store;
mod tags;

pub use reconciler::{
    FileOutcome, ImportDecision, LibraryReconciler, MatchPlan, ReconcileError, ReconcilerConfig,
    ScanStatus, ScanSummary,
};
pub use scanner::{is_audio_file, scan_library, FileKind, ScannedFile};
pub use store::{SqliteTrackStore, StoredTrack, TrackStore};
pub use tags::{read_tags, read_tags_blocking, TrackTags};
