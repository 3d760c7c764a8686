//! Page acquisition for sitecrawl.
//!
//! This crate provides:
//! - [`links`]: link canonicalization and internal/external partitioning
//! - [`session`]: the automation-session seam and an HTTP-backed session
//! - [`navigate`]: the two-step (strict, then relaxed) navigation strategy

pub mod links;
pub mod navigate;
pub mod session;

pub use links::{
    LinkError, PartitionedLinks, canonicalize, canonicalize_absolute, is_binary_resource,
    is_internal, partition_links,
};
pub use navigate::{NavigationOutcome, navigate};
pub use session::{
    BrowserSession, HttpSession, HttpSessionFactory, NavigationError, OpenOptions, PageSnapshot,
    SessionFactory, WaitStrategy, extract_links,
};
