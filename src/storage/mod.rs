//! Storage layers under the ODB facade: the local loose-object store with
//! its push quarantine, the parsed-object cache, and the remote blob-store
//! adapter.

pub mod cache;
pub mod loose;
pub mod quarantine;
pub mod remote;
