//! 镜像引用模块
//!
//! 该模块维护所有受管组件的镜像目录，并根据 Installation 中的镜像仓库、
//! 镜像路径、镜像前缀以及可选的 ImageSet 摘要计算最终的镜像引用。

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{Error, Result};

/// 默认镜像仓库
pub const DEFAULT_REGISTRY: &str = "quay.io/";

/// 表示使用默认值的占位符
pub const USE_DEFAULT: &str = "UseDefault";

/// 企业版发布版本，ImageSet 名称由它派生
pub const ENTERPRISE_RELEASE: &str = "v3.16.0";

/// 镜像摘要映射：镜像名 -> 摘要
pub type ImageDigests = BTreeMap<String, String>;

static DIGEST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^sha256:[a-fA-F0-9]+$").expect("摘要正则表达式无效")
});

/// 组件镜像
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentImage {
    /// 镜像名，包含镜像路径
    pub image: &'static str,
    /// 镜像版本
    pub version: &'static str,
}

pub const COMPONENT_SASHA: ComponentImage = ComponentImage {
    image: "tigera/sasha",
    version: "v0.9.1",
};

pub const COMPONENT_THREAT_ID: ComponentImage = ComponentImage {
    image: "tigera/threat-id",
    version: "v0.9.1",
};

pub const COMPONENT_IMAGE_ASSURANCE_API: ComponentImage = ComponentImage {
    image: "tigera/image-assurance-api",
    version: "v1.7.2",
};

pub const COMPONENT_IMAGE_ASSURANCE_SCANNER: ComponentImage = ComponentImage {
    image: "tigera/image-assurance-scanner",
    version: "v1.7.2",
};

pub const COMPONENT_IMAGE_ASSURANCE_DB_MIGRATOR: ComponentImage = ComponentImage {
    image: "tigera/image-assurance-db-migrator",
    version: "v1.7.2",
};

pub const COMPONENT_IMAGE_ASSURANCE_CAW: ComponentImage = ComponentImage {
    image: "tigera/image-assurance-caw",
    version: "v1.7.2",
};

pub const COMPONENT_API_SERVER: ComponentImage = ComponentImage {
    image: "tigera/cnx-apiserver",
    version: ENTERPRISE_RELEASE,
};

pub const COMPONENT_QUERY_SERVER: ComponentImage = ComponentImage {
    image: "tigera/cnx-queryserver",
    version: ENTERPRISE_RELEASE,
};

pub const COMPONENT_MANAGER: ComponentImage = ComponentImage {
    image: "tigera/cnx-manager",
    version: ENTERPRISE_RELEASE,
};

pub const COMPONENT_VOLTRON: ComponentImage = ComponentImage {
    image: "tigera/voltron",
    version: ENTERPRISE_RELEASE,
};

/// 所有已知的组件镜像
pub const ALL_COMPONENTS: &[ComponentImage] = &[
    COMPONENT_SASHA,
    COMPONENT_THREAT_ID,
    COMPONENT_IMAGE_ASSURANCE_API,
    COMPONENT_IMAGE_ASSURANCE_SCANNER,
    COMPONENT_IMAGE_ASSURANCE_DB_MIGRATOR,
    COMPONENT_IMAGE_ASSURANCE_CAW,
    COMPONENT_API_SERVER,
    COMPONENT_QUERY_SERVER,
    COMPONENT_MANAGER,
    COMPONENT_VOLTRON,
];

/// 企业版 ImageSet 的名称
pub fn enterprise_image_set_name() -> String {
    format!("enterprise-{}", ENTERPRISE_RELEASE)
}

fn is_set(value: &str) -> bool {
    !value.is_empty() && value != USE_DEFAULT
}

/// 将镜像名中最后一个 `/` 之前的部分替换为指定路径
fn replace_image_path(image: &str, image_path: &str) -> String {
    let name = image.rsplit('/').next().unwrap_or(image);
    format!("{}/{}", image_path.trim_end_matches('/'), name)
}

/// 在镜像名前插入前缀
fn insert_prefix(image: &str, prefix: &str) -> String {
    match image.rsplit_once('/') {
        Some((path, name)) => format!("{}/{}{}", path, prefix, name),
        None => format!("{}{}", prefix, image),
    }
}

/// 计算组件的镜像引用
///
/// 没有提供摘要时返回 `<registry><image>:<version>`，
/// 提供摘要时返回 `<registry><image>@<digest>`，摘要缺失则报错。
pub fn get_reference(
    component: &ComponentImage,
    registry: &str,
    image_path: &str,
    image_prefix: &str,
    digests: Option<&ImageDigests>,
) -> Result<String> {
    let mut registry = if is_set(registry) {
        registry.to_string()
    } else {
        DEFAULT_REGISTRY.to_string()
    };
    if !registry.ends_with('/') {
        registry.push('/');
    }

    let mut image = component.image.to_string();
    if is_set(image_path) {
        image = replace_image_path(&image, image_path);
    }
    if is_set(image_prefix) {
        image = insert_prefix(&image, image_prefix);
    }

    let reference = match digests {
        None => format!("{}{}:{}", registry, image, component.version),
        Some(digests) => {
            let digest = digests.get(component.image).ok_or_else(|| {
                Error::image(format!("ImageSet did not contain image {}", component.image))
            })?;
            format!("{}{}@{}", registry, image, digest)
        }
    };

    debug!("解析镜像 {} -> {}", component.image, reference);
    Ok(reference)
}

/// 校验 ImageSet 中的镜像摘要
///
/// 每个条目必须是已知组件镜像，且摘要格式为 `sha256:<hex>`。
pub fn validate_image_digests(digests: &ImageDigests) -> Result<()> {
    let mut errors = Vec::new();

    for (image, digest) in digests {
        if !ALL_COMPONENTS.iter().any(|c| c.image == image) {
            errors.push(format!("unexpected image {} in ImageSet", image));
            continue;
        }
        if !DIGEST_RE.is_match(digest) {
            errors.push(format!("invalid digest {} for image {}", digest, image));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::validation(errors.join(", ")))
    }
}
