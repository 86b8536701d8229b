//! 证书管理组件
//!
//! 把信任包写入组件所在命名空间，供该命名空间中的工作负载挂载。

use sentinel_common::ImageDigests;

use super::{Component, OsType, RenderedObjects};
use crate::certificates::TrustedBundle;
use crate::error::Result;

pub struct CertificateManagementComponent {
    namespace: String,
    trusted_bundle: TrustedBundle,
}

impl CertificateManagementComponent {
    pub fn new(namespace: impl Into<String>, trusted_bundle: TrustedBundle) -> Self {
        Self {
            namespace: namespace.into(),
            trusted_bundle,
        }
    }
}

impl Component for CertificateManagementComponent {
    fn resolve_images(&mut self, _digests: Option<&ImageDigests>) -> Result<()> {
        Ok(())
    }

    fn objects(&self) -> Result<RenderedObjects> {
        let mut rendered = RenderedObjects::default();
        rendered.push(&self.trusted_bundle.config_map(&self.namespace))?;
        Ok(rendered)
    }

    fn supported_os_type(&self) -> OsType {
        OsType::Any
    }
}
