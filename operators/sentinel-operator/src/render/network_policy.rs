//! Calico 网络策略辅助函数

use crate::crd::calico::{EntityRule, ServiceMatch};

/// 组件策略所在的 tier
pub const TIGERA_COMPONENT_TIER: &str = "allow-tigera";

/// 组件策略名称前缀
pub const TIGERA_COMPONENT_POLICY_PREFIX: &str = "allow-tigera.";

/// 高优先级策略顺序
pub const HIGH_PRECEDENCE_ORDER: f64 = 1.0;

pub const TCP_PROTOCOL: &str = "TCP";

/// 按 `k8s-app` 标签选择工作负载
pub fn kubernetes_app_selector(app: &str) -> String {
    format!("k8s-app == '{}'", app)
}

/// 指定命名空间中某个应用的某个端口
pub fn create_entity_rule(namespace: &str, app: &str, port: u16) -> EntityRule {
    EntityRule {
        selector: Some(kubernetes_app_selector(app)),
        namespace_selector: Some(format!("projectcalico.org/name == '{}'", namespace)),
        ports: vec![port],
        services: None,
    }
}

/// 按 Service 名称选择目标
pub fn create_service_selector_entity_rule(namespace: &str, name: &str) -> EntityRule {
    EntityRule {
        selector: None,
        namespace_selector: None,
        ports: Vec::new(),
        services: Some(ServiceMatch {
            name: name.to_string(),
            namespace: namespace.to_string(),
        }),
    }
}
