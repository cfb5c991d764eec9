pub mod args;
pub mod cache;
pub mod controller;
pub mod error;
pub mod key;
pub mod lifecycle;
pub mod queue;
pub mod reconciler;

pub mod consts {
    pub const NAME: &str = "bucket-operator";
}
