pub mod authorizer;
pub mod b2_backend;
pub mod backend;
pub mod finalizer;
pub mod local_backend;
pub mod metadata;
pub mod part_uploader;
pub mod target_issuer;
