//! # dwd-bootstrap – Service account provisioning for domain-wide delegation
//!
//! Creates the service account whose key `dwd-core` signs with, writes the
//! key file (tagged with the Workspace domain) and prints the admin-console
//! steps that finish the delegation grant. `decommission` undoes it.
//!
//! | Service        | Module | API Base                                    |
//! |----------------|--------|---------------------------------------------|
//! | IAM            | `iam`  | `https://iam.googleapis.com/v1`             |
//! | Service Usage  | `iam`  | `https://serviceusage.googleapis.com/v1`    |

pub mod error;
pub mod client;
pub mod iam;
pub mod provision;

pub use client::ApiClient;
pub use error::{BootstrapError, BootstrapErrorKind, BootstrapResult};
pub use provision::{DecommissionReport, ProvisionReport, ProvisionRequest, Provisioner};
