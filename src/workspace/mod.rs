//! Workspace (Notion) integration.
//!
//! Reading: schema discovery, paginated fetches of Companies and Users,
//! file-backed TTL caches. Matching: fuzzy resolution of extracted names
//! against those caches. Writing: schema-aware property mapping and
//! duplicate-aware page creation.

pub mod cache;
pub mod client;
pub mod mapper;
pub mod matcher;
pub mod writer;

pub use cache::{CompanyGroup, CompanyRow, WorkspaceCaches, WorkspaceUser, WorkspaceUserType};
pub use client::WorkspaceClient;
pub use mapper::{build_properties, CollabRecord};
pub use matcher::{
    person_confidence_level, CompanyMatch, CompanyMatcher, ConfidenceLevel, MatchType,
    PersonAlternative, PersonMatch, PersonMatcher,
};
pub use writer::{WriteResult, WriteStatus, Writer};
