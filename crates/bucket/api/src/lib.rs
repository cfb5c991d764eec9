pub mod bucket;

pub mod consts {
    pub const GROUP: &str = "bucket.ulagbulag.io";
    pub const VERSION: &str = "v1";
}
