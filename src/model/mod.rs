//! Domain records persisted by the store.

pub mod batch_change;
pub mod batch_spec;
pub mod changeset;
pub mod changeset_spec;
pub mod identity;
pub mod resolution_job;

pub use batch_change::BatchChange;
pub use batch_spec::BatchSpec;
pub use changeset::{
    BatchChangeAssoc, Changeset, ExternalState, PublicationState, ReconcilerState,
};
pub use changeset_spec::{ChangesetSpec, ChangesetSpecType, PublishedValue};
pub use identity::{Org, Repo, User};
pub use resolution_job::{BatchSpecResolutionJob, ExecutionLogEntry, JobState};
