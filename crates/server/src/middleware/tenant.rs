use axum::http::HeaderMap;
use weaver_core::TenantId;

/// Header carrying the caller's tenant
pub const TENANT_HEADER: &str = "x-tenant-id";

/// Extract the tenant from request headers
///
/// Blank or non-UTF-8 values are treated as absent.
pub fn extract_tenant_from_headers(headers: &HeaderMap) -> Option<TenantId> {
    let value = headers.get(TENANT_HEADER)?;
    let tenant = value.to_str().ok()?.trim();

    if tenant.is_empty() {
        None
    } else {
        Some(TenantId::new(tenant))
    }
}
