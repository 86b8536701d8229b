//! 自定义资源定义模块
//!
//! 该模块定义了 Operator 读取和管理的自定义资源类型：附加组件资源、Installation、
//! ImageSet、TigeraStatus 以及 Calico 的 NetworkPolicy 与 LicenseKey。

pub mod calico;
pub mod features;
pub mod image_set;
pub mod installation;
pub mod tigera_status;

pub use calico::{EntityRule, LicenseKey, NetworkPolicy, NetworkPolicySpec, Rule, ServiceMatch};
pub use features::{
    APIServer, APIServerSpec, Authentication, AuthenticationSpec, FeatureStatus, ImageAssurance,
    ImageAssuranceSpec, LogStorage, LogStorageSpec, Manager, ManagerSpec, RuntimeSecurity,
    RuntimeSecuritySpec, DEFAULT_INSTANCE_NAME, STATE_READY,
};
pub use image_set::{ImageDigest, ImageSet, ImageSetSpec};
pub use installation::{Installation, InstallationSpec, ProductVariant, INSTALLATION_NAME};
pub use tigera_status::{TigeraStatus, TigeraStatusCondition, TigeraStatusStatus};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

/// Operator 拥有的全部 CRD
pub fn operator_crds() -> Vec<CustomResourceDefinition> {
    vec![
        Installation::crd(),
        ImageSet::crd(),
        RuntimeSecurity::crd(),
        ImageAssurance::crd(),
        APIServer::crd(),
        LogStorage::crd(),
        Manager::crd(),
        Authentication::crd(),
        TigeraStatus::crd(),
    ]
}

/// 以多文档 YAML 输出全部 CRD
pub fn operator_crds_yaml() -> Result<String, serde_yaml::Error> {
    let mut out = String::new();
    for crd in operator_crds() {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&crd)?);
    }
    Ok(out)
}
