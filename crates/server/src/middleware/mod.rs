pub mod tenant;

pub use tenant::{extract_tenant_from_headers, TENANT_HEADER};
