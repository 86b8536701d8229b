//! ImageSet 处理
//!
//! 管理员可以创建名为 `enterprise-<版本>` 的 ImageSet，用摘要固定组件镜像。
//! 不存在时组件按 Installation 的仓库配置使用带版本标签的镜像。

use sentinel_common::images::{enterprise_image_set_name, validate_image_digests};
use tracing::debug;

use crate::client::{self, ClusterClient};
use crate::crd::ImageSet;
use crate::error::Result;
use crate::render::Component;

/// 读取当前版本对应的 ImageSet
pub async fn get_image_set(client: &dyn ClusterClient) -> Result<Option<ImageSet>> {
    client::get_opt::<ImageSet>(client, None, &enterprise_image_set_name()).await
}

/// 校验 ImageSet 中的镜像与摘要
pub fn validate_image_set(image_set: &ImageSet) -> Result<()> {
    validate_image_digests(&image_set.digests())?;
    Ok(())
}

/// 读取并校验 ImageSet，再为每个组件解析镜像
pub async fn apply_image_set(
    client: &dyn ClusterClient,
    components: &mut [&mut dyn Component],
) -> Result<()> {
    let image_set = get_image_set(client).await?;
    if let Some(image_set) = &image_set {
        validate_image_set(image_set)?;
        debug!("使用 ImageSet {}", enterprise_image_set_name());
    }

    let digests = image_set.as_ref().map(ImageSet::digests);
    for component in components.iter_mut() {
        component.resolve_images(digests.as_ref())?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeClient;
    use crate::crd::{ImageDigest, ImageSetSpec, InstallationSpec};
    use crate::render::api_server::{ApiServerComponent, ApiServerConfig, API_SERVER_NAME};
    use k8s_openapi::api::apps::v1::Deployment;
    use sentinel_common::images::ENTERPRISE_RELEASE;

    fn image_set(images: &[(&str, &str)]) -> ImageSet {
        ImageSet::new(
            &enterprise_image_set_name(),
            ImageSetSpec {
                images: images
                    .iter()
                    .map(|(image, digest)| ImageDigest {
                        image: image.to_string(),
                        digest: digest.to_string(),
                    })
                    .collect(),
            },
        )
    }

    fn component() -> ApiServerComponent {
        ApiServerComponent::new(ApiServerConfig {
            pull_secrets: Vec::new(),
            installation: InstallationSpec::default(),
        })
    }

    /// 渲染出的 apiserver Deployment 中各容器的镜像
    fn images(component: &ApiServerComponent) -> Vec<String> {
        let deployment: Deployment = component
            .objects()
            .unwrap()
            .create
            .iter()
            .find(|o| o.is("Deployment", API_SERVER_NAME))
            .unwrap()
            .typed()
            .unwrap();
        deployment
            .spec
            .unwrap()
            .template
            .spec
            .unwrap()
            .containers
            .into_iter()
            .filter_map(|c| c.image)
            .collect()
    }

    #[tokio::test]
    async fn test_without_image_set_uses_tags() {
        let client = FakeClient::new();
        let mut component = component();
        apply_image_set(&client, &mut [&mut component]).await.unwrap();

        assert_eq!(
            images(&component),
            vec![
                format!("quay.io/tigera/cnx-apiserver:{}", ENTERPRISE_RELEASE),
                format!("quay.io/tigera/cnx-queryserver:{}", ENTERPRISE_RELEASE),
            ]
        );
    }

    #[tokio::test]
    async fn test_image_set_pins_digests() {
        let client = FakeClient::new();
        let digest = "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        client.insert(&image_set(&[
            ("tigera/cnx-apiserver", digest),
            ("tigera/cnx-queryserver", digest),
        ]));

        let mut component = component();
        apply_image_set(&client, &mut [&mut component]).await.unwrap();

        assert_eq!(
            images(&component),
            vec![
                format!("quay.io/tigera/cnx-apiserver@{}", digest),
                format!("quay.io/tigera/cnx-queryserver@{}", digest),
            ]
        );
    }

    #[tokio::test]
    async fn test_image_set_missing_component_image() {
        let client = FakeClient::new();
        client.insert(&image_set(&[(
            "tigera/cnx-apiserver",
            "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef",
        )]));

        let mut component = component();
        let err = apply_image_set(&client, &mut [&mut component])
            .await
            .unwrap_err();
        assert!(
            err.to_string()
                .contains("ImageSet did not contain image tigera/cnx-queryserver"),
            "{}",
            err
        );
    }

    #[tokio::test]
    async fn test_invalid_image_set_is_rejected() {
        let client = FakeClient::new();
        client.insert(&image_set(&[("tigera/unknown", "sha256:abc")]));

        let mut component = component();
        let err = apply_image_set(&client, &mut [&mut component])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unexpected image tigera/unknown"), "{}", err);
    }
}
