//! 证书读取与信任包
//!
//! CA 与叶子证书由其他控制器签发，这里只负责读取它们，
//! 并为需要校验对端的组件生成信任包 ConfigMap。

use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Secret, Volume, VolumeMount,
};
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use sentinel_common::hash::sha256_hash;
use std::collections::BTreeMap;
use tracing::debug;

use crate::client::{self, ClusterClient};
use crate::error::{Error, Result};

/// CA 私钥 Secret 名称
pub const CA_SECRET_NAME: &str = "tigera-ca-private";

/// 信任包 ConfigMap 名称
pub const TRUSTED_BUNDLE_NAME: &str = "tigera-ca-bundle";

/// 信任包文件名
pub const TRUSTED_BUNDLE_KEY: &str = "tigera-ca-bundle.crt";

/// 信任包挂载目录
pub const TRUSTED_CERT_MOUNT_PATH: &str = "/etc/pki/tls/certs/";

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_KEY_KEY: &str = "tls.key";

/// Pod 模板哈希注解前缀
pub const HASH_ANNOTATION_PREFIX: &str = "hash.operator.tigera.io";

/// 证书与私钥
#[derive(Clone, Debug, PartialEq)]
pub struct KeyPair {
    pub name: String,
    pub namespace: String,
    pub certificate: Vec<u8>,
    pub key: Vec<u8>,
}

impl KeyPair {
    /// 从 TLS Secret 解析，缺少 `tls.crt` 或 `tls.key` 时报错
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        let data = secret.data.clone().unwrap_or_default();

        let field = |key: &str| {
            data.get(key)
                .map(|value| value.0.clone())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| Error::certificate(format!("secret {} does not contain {}", name, key)))
        };

        Ok(Self {
            certificate: field(TLS_CERT_KEY)?,
            key: field(TLS_KEY_KEY)?,
            namespace: secret.metadata.namespace.clone().unwrap_or_default(),
            name,
        })
    }

    /// 复制到目标命名空间的 Secret
    pub fn secret(&self, namespace: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            type_: Some("kubernetes.io/tls".to_string()),
            data: Some(BTreeMap::from([
                (TLS_CERT_KEY.to_string(), ByteString(self.certificate.clone())),
                (TLS_KEY_KEY.to_string(), ByteString(self.key.clone())),
            ])),
            ..Default::default()
        }
    }

    /// 证书内容哈希
    pub fn hash(&self) -> String {
        sha256_hash(&self.certificate)
    }
}

/// 证书管理器
#[derive(Clone, Debug)]
pub struct CertificateManager {
    ca: KeyPair,
}

impl CertificateManager {
    /// 读取 Operator 命名空间中的 CA，不存在时返回 `NotFound`
    pub async fn create(client: &dyn ClusterClient, operator_namespace: &str) -> Result<Self> {
        let secret =
            client::get::<Secret>(client, Some(operator_namespace), CA_SECRET_NAME).await?;
        let ca = KeyPair::from_secret(&secret)?;
        debug!("已加载 CA {}/{}", operator_namespace, CA_SECRET_NAME);

        Ok(Self { ca })
    }

    pub fn ca(&self) -> &KeyPair {
        &self.ca
    }

    /// 读取叶子证书，不存在时返回 `None`
    pub async fn get_certificate(
        &self,
        client: &dyn ClusterClient,
        name: &str,
        namespace: &str,
    ) -> Result<Option<KeyPair>> {
        match client::get_opt::<Secret>(client, Some(namespace), name).await? {
            Some(secret) => Ok(Some(KeyPair::from_secret(&secret)?)),
            None => Ok(None),
        }
    }

    /// 以 CA 与给定证书构建信任包
    pub fn create_trusted_bundle(&self, certificates: &[&KeyPair]) -> TrustedBundle {
        let mut bundle = TrustedBundle::new(&self.ca);
        for certificate in certificates {
            bundle.add(certificate);
        }
        bundle
    }
}

/// 信任包
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrustedBundle {
    certificates: BTreeMap<String, Vec<u8>>,
}

impl TrustedBundle {
    pub fn new(ca: &KeyPair) -> Self {
        let mut bundle = Self::default();
        bundle.add(ca);
        bundle
    }

    pub fn add(&mut self, certificate: &KeyPair) {
        self.certificates
            .insert(certificate.name.clone(), certificate.certificate.clone());
    }

    /// 每个证书一条哈希注解，证书轮换时触发滚动更新
    pub fn hash_annotations(&self) -> BTreeMap<String, String> {
        self.certificates
            .iter()
            .map(|(name, pem)| (format!("{}/{}", HASH_ANNOTATION_PREFIX, name), sha256_hash(pem)))
            .collect()
    }

    /// 按证书名排序拼接的 PEM 内容
    pub fn pem(&self) -> String {
        let mut out = String::new();
        for (name, pem) in &self.certificates {
            out.push_str(&format!("# certificate name: {}\n", name));
            out.push_str(String::from_utf8_lossy(pem).trim_end());
            out.push('\n');
        }
        out
    }

    pub fn config_map(&self, namespace: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(TRUSTED_BUNDLE_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(TRUSTED_BUNDLE_KEY.to_string(), self.pem())])),
            ..Default::default()
        }
    }

    pub fn volume(&self) -> Volume {
        Volume {
            name: TRUSTED_BUNDLE_NAME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(TRUSTED_BUNDLE_NAME.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn volume_mount(&self) -> VolumeMount {
        VolumeMount {
            name: TRUSTED_BUNDLE_NAME.to_string(),
            mount_path: TRUSTED_CERT_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }
    }

    /// 信任包文件在容器内的完整路径
    pub fn bundle_path() -> String {
        format!("{}{}", TRUSTED_CERT_MOUNT_PATH, TRUSTED_BUNDLE_KEY)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::fake::FakeClient;

    pub(crate) fn tls_secret(name: &str, namespace: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                (TLS_CERT_KEY.to_string(), ByteString(format!("{}-cert", name).into_bytes())),
                (TLS_KEY_KEY.to_string(), ByteString(format!("{}-key", name).into_bytes())),
            ])),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_missing_ca_is_not_found() {
        let client = FakeClient::new();
        let err = CertificateManager::create(&client, "tigera-operator")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_get_certificate() {
        let client = FakeClient::new();
        client.insert(&tls_secret(CA_SECRET_NAME, "tigera-operator"));
        let manager = CertificateManager::create(&client, "tigera-operator")
            .await
            .unwrap();

        let missing = manager
            .get_certificate(&client, "internal-manager-tls", "tigera-operator")
            .await
            .unwrap();
        assert!(missing.is_none());

        let mut broken = tls_secret("internal-manager-tls", "tigera-operator");
        broken.data.as_mut().unwrap().remove(TLS_CERT_KEY);
        client.insert(&broken);
        let err = manager
            .get_certificate(&client, "internal-manager-tls", "tigera-operator")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("tls.crt"));

        client.insert(&tls_secret("internal-manager-tls", "tigera-operator"));
        let pair = manager
            .get_certificate(&client, "internal-manager-tls", "tigera-operator")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pair.certificate, b"internal-manager-tls-cert");
    }

    #[test]
    fn test_trusted_bundle() {
        let ca = KeyPair::from_secret(&tls_secret(CA_SECRET_NAME, "tigera-operator")).unwrap();
        let leaf = KeyPair::from_secret(&tls_secret("internal-manager-tls", "tigera-operator")).unwrap();
        let manager = CertificateManager { ca };
        let bundle = manager.create_trusted_bundle(&[&leaf]);

        let annotations = bundle.hash_annotations();
        assert_eq!(annotations.len(), 2);
        assert!(annotations.contains_key("hash.operator.tigera.io/tigera-ca-private"));

        let cm = bundle.config_map("tigera-manager");
        let data = cm.data.unwrap();
        let pem = &data[TRUSTED_BUNDLE_KEY];
        let leaf_at = pem.find("internal-manager-tls-cert").unwrap();
        let ca_at = pem.find("tigera-ca-private-cert").unwrap();
        assert!(leaf_at < ca_at);

        assert_eq!(TrustedBundle::bundle_path(), "/etc/pki/tls/certs/tigera-ca-bundle.crt");
        assert_eq!(bundle.volume_mount().mount_path, TRUSTED_CERT_MOUNT_PATH);
    }
}
