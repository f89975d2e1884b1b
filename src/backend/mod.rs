//! Backend collaborator contracts.
//!
//! The hosted backend (auth, row storage, change notifications) is external.
//! The core reaches it only through these traits; the Supabase adapter in
//! `integrations::supabase` is the production implementation.

pub mod traits;

pub use traits::{
    AuthBackend, AuthChange, NewProfile, PointsUpdate, Role, Session, SignUpAttrs, User,
    VisitStore, VisitStoreError,
};
