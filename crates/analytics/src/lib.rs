//! In-process collection and delivery of API analytics records.
//!
//! Records are validated and enriched with tenant identity, buffered on disk
//! per tenant (`<organization>~<environment>`), and periodically staged and
//! shipped by a bounded upload worker pool. A crash between staging and
//! upload is recovered on the next [`manager::Manager::new`] call: any temp
//! file left open is validated (and, for gzip uploaders, repaired) and
//! requeued.
//!
//! ```ignore
//! let manager = Manager::new(opts)?;
//! manager.start(collection_interval).await;
//! manager.send_records(&auth, records).await?;
//! manager.close().await;
//! ```

pub mod auth;
pub mod bucket;
pub mod clock;
pub mod error;
pub mod manager;
pub mod pool;
pub mod record;
pub mod recovery;
pub mod staging;
pub mod uploader;

pub use auth::AuthContext;
pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{ConfigError, SendError};
pub use manager::{Manager, ManagerOptions};
pub use record::{Record, ValidationError};
pub use uploader::{Uploader, UploadError};
