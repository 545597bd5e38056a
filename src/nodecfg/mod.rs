//! Layered node configuration: merge/diff primitives, the controller-side
//! composition helper, the minion-side applied-config wrapper, and the
//! post-change action machinery.

pub mod actions;
pub mod fwparams;
pub mod helper;
pub mod merge;
pub mod node_wrapper;

pub use actions::{ordered_effects, CfgAction, ConfigMetadata};
pub use fwparams::MAX_FW_RUNTIME_CFG_POOL_SIZE;
pub use helper::{ConfigHelper, ConfigPaths, SwVersion};
pub use merge::{config_md5, full_difference, flatten_keys, merge, merge_layers};
pub use node_wrapper::NodeConfigWrapper;
