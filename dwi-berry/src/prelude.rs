//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::Idx3d;

pub use crate::data::{is_4d, MaskVolume, NiftiHeaderAttr, Reorientation, ScalarVolume};

pub use crate::consts::{ElemType, DTI_METRICS};

pub use crate::config::PipelineConfig;
pub use crate::dataset::{
    discover, AtlasInputs, AtlasTarget, DerivativeProbe, Discovery, DwiInputs, RawDwiProbe,
    Session, SessionFilter,
};
pub use crate::error::{PipelineError, StageError};
pub use crate::naming::{ArtifactName, Datatype, DerivativeTree, Extension, SessionTree};
pub use crate::pipeline::atlas::AtlasOptions;
pub use crate::pipeline::dwi::{DtiOptions, DtiVariant};
pub use crate::pipeline::{BatchReport, PipelineRunner, SessionPlan, SessionStatus};
pub use crate::space::{Space, SpaceTracker};
pub use crate::stage::{StageDescriptor, StageOutcome, StageRunner};
pub use crate::tool::{ProcessRunner, ToolRunner, Toolbox};
