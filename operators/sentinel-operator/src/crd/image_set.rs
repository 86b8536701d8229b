//! ImageSet 资源：管理员提供的镜像摘要集合

use kube::CustomResource;
use schemars::JsonSchema;
use sentinel_common::ImageDigests;
use serde::{Deserialize, Serialize};

/// 单个镜像摘要
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct ImageDigest {
    /// 镜像名，例如 `tigera/sasha`
    pub image: String,
    /// 摘要，例如 `sha256:...`
    pub digest: String,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[kube(group = "operator.tigera.io", version = "v1", kind = "ImageSet")]
pub struct ImageSetSpec {
    #[serde(default)]
    pub images: Vec<ImageDigest>,
}

impl ImageSet {
    /// 转换为镜像名到摘要的映射
    pub fn digests(&self) -> ImageDigests {
        self.spec
            .images
            .iter()
            .map(|i| (i.image.clone(), i.digest.clone()))
            .collect()
    }
}
