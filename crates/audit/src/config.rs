use anyhow::Context;
use idmap_core::config::{IdMapConfig, MapNamespace};
use idmap_core::schema::KeySchema;

/// Audit tool configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub database_url: String,
    pub namespace: MapNamespace,
    pub source_schema: KeySchema,
    pub destination_schema: KeySchema,
    /// PostgreSQL schema holding the map tables (default: `public`).
    pub pg_schema: String,
    /// Pool size (default: `5`).
    pub max_connections: u32,
}

impl AuditConfig {
    /// Load configuration from environment variables.
    ///
    /// | Env Var                    | Default  |
    /// |----------------------------|----------|
    /// | `DATABASE_URL`             | required |
    /// | `IDMAP_NAMESPACE`          | required |
    /// | `IDMAP_SOURCE_SCHEMA`      | required |
    /// | `IDMAP_DESTINATION_SCHEMA` | required |
    /// | `IDMAP_PG_SCHEMA`          | `public` |
    /// | `IDMAP_MAX_CONNECTIONS`    | `5`      |
    ///
    /// Key schemas use the `name:type,name:type` form, e.g. `id:integer,lang:text`.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let required = |key: &str| lookup(key).with_context(|| format!("{key} must be set"));

        let database_url = required("DATABASE_URL")?;
        let namespace = MapNamespace::new(required("IDMAP_NAMESPACE")?)
            .context("IDMAP_NAMESPACE is not a valid namespace")?;
        let source_schema: KeySchema = required("IDMAP_SOURCE_SCHEMA")?
            .parse()
            .context("IDMAP_SOURCE_SCHEMA is not a valid key schema")?;
        let destination_schema: KeySchema = required("IDMAP_DESTINATION_SCHEMA")?
            .parse()
            .context("IDMAP_DESTINATION_SCHEMA is not a valid key schema")?;

        let pg_schema = lookup("IDMAP_PG_SCHEMA").unwrap_or_else(|| "public".into());

        let max_connections: u32 = lookup("IDMAP_MAX_CONNECTIONS")
            .unwrap_or_else(|| "5".into())
            .parse()
            .context("IDMAP_MAX_CONNECTIONS must be a valid u32")?;

        Ok(Self {
            database_url,
            namespace,
            source_schema,
            destination_schema,
            pg_schema,
            max_connections,
        })
    }

    pub fn id_map_config(&self) -> anyhow::Result<IdMapConfig> {
        Ok(IdMapConfig::builder(
            self.namespace.clone(),
            self.source_schema.clone(),
            self.destination_schema.clone(),
        )
        .build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("DATABASE_URL", "postgres://localhost/migrate"),
        ("IDMAP_NAMESPACE", "users"),
        ("IDMAP_SOURCE_SCHEMA", "id:integer,lang:text"),
        ("IDMAP_DESTINATION_SCHEMA", "uid:integer"),
    ];

    #[test]
    fn defaults_apply_when_optional_vars_missing() {
        let config = AuditConfig::from_lookup(lookup(REQUIRED)).unwrap();
        assert_eq!(config.namespace.as_str(), "users");
        assert_eq!(config.source_schema.arity(), 2);
        assert_eq!(config.pg_schema, "public");
        assert_eq!(config.max_connections, 5);
        assert!(config.id_map_config().is_ok());
    }

    #[test]
    fn missing_required_var_is_reported() {
        let err = AuditConfig::from_lookup(lookup(&REQUIRED[..3])).unwrap_err();
        assert!(err.to_string().contains("IDMAP_DESTINATION_SCHEMA"));
    }

    #[test]
    fn bad_schema_is_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars[2] = ("IDMAP_SOURCE_SCHEMA", "id:float");
        assert!(AuditConfig::from_lookup(lookup(&vars)).is_err());
    }

    #[test]
    fn max_connections_must_parse() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("IDMAP_MAX_CONNECTIONS", "many"));
        assert!(AuditConfig::from_lookup(lookup(&vars)).is_err());
    }
}
