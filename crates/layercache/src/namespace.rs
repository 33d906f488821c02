//! Key and channel naming shared by every component of one deployment.

const KEY_ROOT: &str = "layering-cache";

/// Deployment namespace, resolved once from configuration.
///
/// The scope is `"{env}-{service}"` when an environment is set and
/// `"{service}"` otherwise. Every store key the engine writes is derived
/// from it, so deployments sharing one Redis never see each other's data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    scope: String,
}

impl Namespace {
    pub fn new(service: &str, env: Option<&str>) -> Self {
        let scope = match env.map(str::trim).filter(|e| !e.is_empty()) {
            Some(env) => format!("{env}-{service}"),
            None => service.to_string(),
        };
        Self { scope }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Prefix of every remote value key of `cache_name`.
    pub fn data_prefix(&self, cache_name: &str) -> String {
        format!("{}:{}:", self.scope, cache_name)
    }

    /// Pub/sub channel carrying live invalidations.
    pub fn channel(&self) -> String {
        format!("{KEY_ROOT}:channel:{}", self.scope)
    }

    /// Durable list holding recent invalidations, newest first.
    pub fn message_queue(&self) -> String {
        format!("{KEY_ROOT}:message:{}", self.scope)
    }

    /// Prefix of every durable stats record.
    pub fn stats_prefix(&self) -> String {
        format!("{KEY_ROOT}:cache_stats_info:{}:", self.scope)
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new("layercache", None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_with_and_without_env() {
        assert_eq!(Namespace::new("orders", Some("prod")).scope(), "prod-orders");
        assert_eq!(Namespace::new("orders", None).scope(), "orders");
        assert_eq!(Namespace::new("orders", Some("  ")).scope(), "orders");
    }

    #[test]
    fn test_derived_keys() {
        let ns = Namespace::new("orders", Some("dev"));
        assert_eq!(ns.data_prefix("user"), "dev-orders:user:");
        assert_eq!(ns.channel(), "layering-cache:channel:dev-orders");
        assert_eq!(ns.message_queue(), "layering-cache:message:dev-orders");
        assert_eq!(ns.stats_prefix(), "layering-cache:cache_stats_info:dev-orders:");
    }
}
