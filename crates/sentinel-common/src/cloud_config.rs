//! 云配置模块
//!
//! 解析托管 Elasticsearch 场景下的云配置 ConfigMap 数据。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// 云配置 ConfigMap 名称
pub const CLOUD_CONFIG_CONFIG_MAP_NAME: &str = "tigera-secure-cloud-config";

const TENANT_ID_KEY: &str = "tenantId";
const TENANT_NAME_KEY: &str = "tenantName";
const EXTERNAL_ES_DOMAIN_KEY: &str = "externalESDomain";
const EXTERNAL_KIBANA_DOMAIN_KEY: &str = "externalKibanaDomain";
const ENABLE_MTLS_KEY: &str = "enableMTLS";

/// 云配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudConfig {
    pub tenant_id: String,
    pub tenant_name: String,
    pub external_es_domain: String,
    pub external_kibana_domain: String,
    pub enable_mtls: bool,
}

fn required(data: &BTreeMap<String, String>, key: &str) -> Result<String> {
    match data.get(key) {
        Some(value) if !value.is_empty() => Ok(value.clone()),
        _ => Err(Error::config(format!("'{}' is not set", key))),
    }
}

impl CloudConfig {
    pub fn new(
        tenant_id: impl Into<String>,
        tenant_name: impl Into<String>,
        external_es_domain: impl Into<String>,
        external_kibana_domain: impl Into<String>,
        enable_mtls: bool,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            tenant_name: tenant_name.into(),
            external_es_domain: external_es_domain.into(),
            external_kibana_domain: external_kibana_domain.into(),
            enable_mtls,
        }
    }

    /// 从 ConfigMap 数据解析云配置
    ///
    /// 除 `enableMTLS` 外所有键都必须存在且非空；`enableMTLS` 缺省为 false，
    /// 存在时必须是布尔值。
    pub fn from_data(data: &BTreeMap<String, String>) -> Result<Self> {
        let tenant_id = required(data, TENANT_ID_KEY)?;
        let tenant_name = required(data, TENANT_NAME_KEY)?;
        let external_es_domain = required(data, EXTERNAL_ES_DOMAIN_KEY)?;
        let external_kibana_domain = required(data, EXTERNAL_KIBANA_DOMAIN_KEY)?;

        let enable_mtls = match data.get(ENABLE_MTLS_KEY).map(String::as_str) {
            None | Some("") => false,
            Some(value) => parse_bool(value).ok_or_else(|| {
                Error::config(format!("'{}' must be a bool, got {:?}", ENABLE_MTLS_KEY, value))
            })?,
        };

        Ok(Self {
            tenant_id,
            tenant_name,
            external_es_domain,
            external_kibana_domain,
            enable_mtls,
        })
    }

    /// 生成 ConfigMap 数据
    pub fn to_data(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (TENANT_ID_KEY.to_string(), self.tenant_id.clone()),
            (TENANT_NAME_KEY.to_string(), self.tenant_name.clone()),
            (EXTERNAL_ES_DOMAIN_KEY.to_string(), self.external_es_domain.clone()),
            (
                EXTERNAL_KIBANA_DOMAIN_KEY.to_string(),
                self.external_kibana_domain.clone(),
            ),
            (ENABLE_MTLS_KEY.to_string(), self.enable_mtls.to_string()),
        ])
    }
}

/// 接受与 Kubernetes 工具链一致的布尔写法
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn full_data() -> BTreeMap<String, String> {
        CloudConfig::new("tenantId", "tenantName", "externalES.com", "externalKb.com", true).to_data()
    }

    #[test]
    fn test_parses_complete_config() {
        let config = CloudConfig::from_data(&full_data()).unwrap();
        assert_eq!(config.tenant_id, "tenantId");
        assert_eq!(config.tenant_name, "tenantName");
        assert_eq!(config.external_es_domain, "externalES.com");
        assert_eq!(config.external_kibana_domain, "externalKb.com");
        assert!(config.enable_mtls);
    }

    #[rstest]
    #[case("tenantId")]
    #[case("tenantName")]
    #[case("externalESDomain")]
    #[case("externalKibanaDomain")]
    fn test_missing_required_key(#[case] key: &str) {
        let mut data = full_data();
        data.remove(key);
        let err = CloudConfig::from_data(&data).unwrap_err();
        assert!(err.to_string().contains(&format!("'{}' is not set", key)));

        let mut data = full_data();
        data.insert(key.to_string(), String::new());
        assert!(CloudConfig::from_data(&data).is_err());
    }

    #[rstest]
    #[case(None, false)]
    #[case(Some(""), false)]
    #[case(Some("false"), false)]
    #[case(Some("True"), true)]
    #[case(Some("1"), true)]
    fn test_enable_mtls_values(#[case] value: Option<&str>, #[case] expected: bool) {
        let mut data = full_data();
        data.remove("enableMTLS");
        if let Some(value) = value {
            data.insert("enableMTLS".to_string(), value.to_string());
        }
        assert_eq!(CloudConfig::from_data(&data).unwrap().enable_mtls, expected);
    }

    #[test]
    fn test_invalid_enable_mtls() {
        let mut data = full_data();
        data.insert("enableMTLS".to_string(), "yes".to_string());
        let err = CloudConfig::from_data(&data).unwrap_err();
        assert!(err.to_string().contains("'enableMTLS' must be a bool"));
    }
}
