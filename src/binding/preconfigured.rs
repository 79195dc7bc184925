//! Preconfigured bindings for well-known backing services
//!
//! A preconfigured block names a service type, the service's own resource and
//! a few options. [`parse_options`] validates and normalizes the options;
//! [`expand`] turns the block into ordinary resource references, projections
//! and nuxeo.conf text, so the projection engine never needs to know about
//! Elasticsearch, Kafka or PostgreSQL.
//!
//! | type      | options                                              |
//! |-----------|------------------------------------------------------|
//! | `ECK`     | `user` (default `elastic`), `tls` = `true`/`false`   |
//! | `Strimzi` | `auth` = `anonymous`/`scram-sha-512`/`tls`, `user`, `listener` = `plain`/`tls` |
//! | `Crunchy` | `user` (default `postgres`)                          |

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::crd::{
    BackingService, BackingServiceResource, CertTransform, CertTransformType,
    PreconfiguredBackingService, ResourceProjection,
};
use crate::Error;

/// Known backing-service types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceType {
    /// Elastic Cloud on Kubernetes
    Eck,
    /// Strimzi Kafka
    Strimzi,
    /// Crunchy Data PostgreSQL
    Crunchy,
}

impl FromStr for ServiceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "eck" => Ok(Self::Eck),
            "strimzi" => Ok(Self::Strimzi),
            "crunchy" => Ok(Self::Crunchy),
            _ => Err(Error::configuration(format!(
                "unknown preconfigured service type '{}', expected one of: ECK, Strimzi, Crunchy",
                s
            ))),
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eck => write!(f, "ECK"),
            Self::Strimzi => write!(f, "Strimzi"),
            Self::Crunchy => write!(f, "Crunchy"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum OptionKind {
    FreeForm,
    Enumerated(&'static [&'static str]),
}

const ECK_OPTIONS: &[(&str, OptionKind)] = &[
    ("user", OptionKind::FreeForm),
    ("tls", OptionKind::Enumerated(&["true", "false"])),
];

const STRIMZI_OPTIONS: &[(&str, OptionKind)] = &[
    (
        "auth",
        OptionKind::Enumerated(&["anonymous", "scram-sha-512", "tls"]),
    ),
    ("user", OptionKind::FreeForm),
    ("listener", OptionKind::Enumerated(&["plain", "tls"])),
];

const CRUNCHY_OPTIONS: &[(&str, OptionKind)] = &[("user", OptionKind::FreeForm)];

impl ServiceType {
    fn schema(self) -> &'static [(&'static str, OptionKind)] {
        match self {
            Self::Eck => ECK_OPTIONS,
            Self::Strimzi => STRIMZI_OPTIONS,
            Self::Crunchy => CRUNCHY_OPTIONS,
        }
    }
}

/// Validated, normalized options of a preconfigured binding
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreconfiguredOptions {
    /// Service type
    pub service: ServiceType,
    /// Lower-cased option names; enumerated values lower-cased
    pub options: BTreeMap<String, String>,
}

impl PreconfiguredOptions {
    fn get(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }
}

/// Validate and normalize the options of a preconfigured binding
pub fn parse_options(
    service_type: &str,
    raw: &BTreeMap<String, String>,
) -> Result<PreconfiguredOptions, Error> {
    let service: ServiceType = service_type.parse()?;
    let schema = service.schema();

    let mut options = BTreeMap::new();
    for (name, value) in raw {
        let lower = name.to_lowercase();
        let Some((_, kind)) = schema.iter().find(|(n, _)| *n == lower) else {
            let known: Vec<&str> = schema.iter().map(|(n, _)| *n).collect();
            return Err(Error::configuration(format!(
                "unknown option '{}' for {}, expected one of: {}",
                name,
                service,
                known.join(", ")
            )));
        };

        let normalized = match kind {
            OptionKind::FreeForm => {
                if value.trim().is_empty() {
                    return Err(Error::configuration(format!(
                        "option '{}' for {} must not be empty",
                        lower, service
                    )));
                }
                value.clone()
            }
            OptionKind::Enumerated(allowed) => {
                let v = value.to_lowercase();
                if !allowed.contains(&v.as_str()) {
                    return Err(Error::configuration(format!(
                        "invalid value '{}' for option '{}' of {}, expected one of: {}",
                        value,
                        lower,
                        service,
                        allowed.join(", ")
                    )));
                }
                v
            }
        };

        if options.insert(lower.clone(), normalized).is_some() {
            return Err(Error::configuration(format!(
                "option '{}' for {} is given more than once",
                lower, service
            )));
        }
    }

    let parsed = PreconfiguredOptions { service, options };
    check_cross_rules(&parsed)?;
    Ok(parsed)
}

fn check_cross_rules(parsed: &PreconfiguredOptions) -> Result<(), Error> {
    if parsed.service != ServiceType::Strimzi {
        return Ok(());
    }
    let auth = parsed.get("auth").unwrap_or("anonymous");
    match (auth, parsed.get("user")) {
        ("anonymous", Some(_)) => {
            return Err(Error::configuration(
                "Strimzi anonymous auth does not take a user",
            ))
        }
        ("anonymous", None) => {}
        (other, None) => {
            return Err(Error::configuration(format!(
                "Strimzi {} auth requires a user",
                other
            )))
        }
        _ => {}
    }
    if auth == "tls" && parsed.get("listener") == Some("plain") {
        return Err(Error::configuration(
            "Strimzi tls auth requires the tls listener",
        ));
    }
    Ok(())
}

// =============================================================================
// Expansion
// =============================================================================

/// A preconfigured binding rewritten as an ordinary one
#[derive(Clone, Debug, PartialEq)]
pub struct Expansion {
    /// Binding with generated resources and configuration text
    pub binding: BackingService,
    /// Nuxeo templates the service needs
    pub templates: Vec<String>,
}

/// Expand the preconfigured block of `binding`
///
/// Resources and configuration text written by hand are kept after the
/// generated ones. Bindings without a preconfigured block pass through.
pub fn expand(binding: &BackingService, mount_base: &str) -> Result<Expansion, Error> {
    let Some(pre) = &binding.preconfigured else {
        return Ok(Expansion {
            binding: binding.clone(),
            templates: vec![],
        });
    };
    if pre.resource.trim().is_empty() {
        return Err(Error::configuration(
            "preconfigured binding needs the service resource name",
        ));
    }

    let options = parse_options(&pre.type_, &pre.settings)?;
    let dir = format!("{}/{}", mount_base.trim_end_matches('/'), binding.name);
    let generated = match options.service {
        ServiceType::Eck => expand_eck(pre, &options, &dir),
        ServiceType::Strimzi => expand_strimzi(pre, &options, &dir),
        ServiceType::Crunchy => expand_crunchy(pre, &options),
    };

    let mut resources = generated.resources;
    resources.extend(binding.resources.iter().cloned());
    let nuxeo_conf = [generated.conf.as_str(), binding.nuxeo_conf.trim()]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n");

    Ok(Expansion {
        binding: BackingService {
            name: binding.name.clone(),
            resources,
            nuxeo_conf,
            preconfigured: None,
        },
        templates: generated.templates,
    })
}

struct Generated {
    resources: Vec<BackingServiceResource>,
    conf: String,
    templates: Vec<String>,
}

fn secret(name: String, projections: Vec<ResourceProjection>) -> BackingServiceResource {
    BackingServiceResource {
        group: String::new(),
        version: "v1".to_string(),
        kind: "Secret".to_string(),
        name,
        projections,
    }
}

fn env_from(key: &str, env: &str) -> ResourceProjection {
    ResourceProjection {
        from: Some(key.to_string()),
        env: Some(env.to_string()),
        ..Default::default()
    }
}

fn store(
    type_: CertTransformType,
    cert: &str,
    private_key: Option<&str>,
    prefix: &str,
    pass_env: &str,
) -> ResourceProjection {
    let flavor = match type_ {
        CertTransformType::TrustStore => "truststore",
        CertTransformType::KeyStore => "keystore",
    };
    ResourceProjection {
        transform: Some(CertTransform {
            type_,
            cert: cert.to_string(),
            private_key: private_key.map(str::to_string),
            store: format!("{}.{}.jks", prefix, flavor),
            password: format!("{}.{}.pass", prefix, flavor),
            pass_env: pass_env.to_string(),
        }),
        ..Default::default()
    }
}

fn conf(lines: &[String]) -> String {
    lines.join("\n")
}

fn expand_eck(pre: &PreconfiguredBackingService, opts: &PreconfiguredOptions, dir: &str) -> Generated {
    let res = &pre.resource;
    let user = opts.get("user").unwrap_or("elastic");
    let tls = opts.get("tls").unwrap_or("true") == "true";
    let scheme = if tls { "https" } else { "http" };

    let mut resources = vec![secret(
        format!("{}-es-elastic-user", res),
        vec![env_from(user, "ELASTIC_PASSWORD")],
    )];
    let mut lines = vec![
        "elasticsearch.client=RestClient".to_string(),
        format!("elasticsearch.addressList={}://{}-es-http:9200", scheme, res),
        format!("elasticsearch.restClient.username={}", user),
        "elasticsearch.restClient.password=${env:ELASTIC_PASSWORD}".to_string(),
    ];
    if tls {
        resources.push(secret(
            format!("{}-es-http-certs-public", res),
            vec![store(
                CertTransformType::TrustStore,
                "tls.crt",
                None,
                "elastic",
                "ELASTIC_TS_PASS",
            )],
        ));
        lines.extend([
            format!("elasticsearch.restClient.truststore.path={}/elastic.truststore.jks", dir),
            "elasticsearch.restClient.truststore.password=${env:ELASTIC_TS_PASS}".to_string(),
            "elasticsearch.restClient.truststore.type=JKS".to_string(),
        ]);
    }

    Generated {
        resources,
        conf: conf(&lines),
        templates: vec![],
    }
}

fn expand_strimzi(
    pre: &PreconfiguredBackingService,
    opts: &PreconfiguredOptions,
    dir: &str,
) -> Generated {
    let res = &pre.resource;
    let auth = opts.get("auth").unwrap_or("anonymous");
    let default_listener = if auth == "tls" { "tls" } else { "plain" };
    let tls_listener = opts.get("listener").unwrap_or(default_listener) == "tls";
    let user = opts.get("user").unwrap_or_default();

    let port = if tls_listener { 9093 } else { 9092 };
    let mut resources = Vec::new();
    let mut lines = vec![
        "kafka.enabled=true".to_string(),
        format!("kafka.bootstrap.servers={}-kafka-bootstrap:{}", res, port),
    ];

    let protocol = match (auth, tls_listener) {
        ("scram-sha-512", true) => "SASL_SSL",
        ("scram-sha-512", false) => "SASL_PLAINTEXT",
        (_, true) => "SSL",
        (_, false) => "PLAINTEXT",
    };
    lines.push(format!("kafka.security.protocol={}", protocol));

    if auth == "scram-sha-512" {
        resources.push(secret(
            user.to_string(),
            vec![env_from("password", "KAFKA_PASSWORD")],
        ));
        lines.extend([
            "kafka.sasl.mechanism=SCRAM-SHA-512".to_string(),
            format!(
                "kafka.sasl.jaas.config=org.apache.kafka.common.security.scram.ScramLoginModule required username=\"{}\" password=\"${{env:KAFKA_PASSWORD}}\";",
                user
            ),
        ]);
    }

    if tls_listener {
        resources.push(secret(
            format!("{}-cluster-ca-cert", res),
            vec![store(
                CertTransformType::TrustStore,
                "ca.crt",
                None,
                "kafka",
                "KAFKA_TS_PASS",
            )],
        ));
        lines.extend([
            format!("kafka.ssl.truststore.location={}/kafka.truststore.jks", dir),
            "kafka.ssl.truststore.password=${env:KAFKA_TS_PASS}".to_string(),
            "kafka.ssl.truststore.type=JKS".to_string(),
        ]);
    }

    if auth == "tls" {
        resources.push(secret(
            user.to_string(),
            vec![store(
                CertTransformType::KeyStore,
                "user.crt",
                Some("user.key"),
                "kafka",
                "KAFKA_KS_PASS",
            )],
        ));
        lines.extend([
            format!("kafka.ssl.keystore.location={}/kafka.keystore.jks", dir),
            "kafka.ssl.keystore.password=${env:KAFKA_KS_PASS}".to_string(),
            "kafka.ssl.keystore.type=JKS".to_string(),
        ]);
    }

    Generated {
        resources,
        conf: conf(&lines),
        templates: vec![],
    }
}

fn expand_crunchy(pre: &PreconfiguredBackingService, opts: &PreconfiguredOptions) -> Generated {
    let res = &pre.resource;
    let user = opts.get("user").unwrap_or("postgres");

    Generated {
        resources: vec![secret(
            format!("{}-{}-secret", res, user),
            vec![env_from("password", "POSTGRES_PASSWORD")],
        )],
        conf: conf(&[
            format!("nuxeo.db.host={}", res),
            "nuxeo.db.port=5432".to_string(),
            format!("nuxeo.db.user={}", user),
            "nuxeo.db.password=${env:POSTGRES_PASSWORD}".to_string(),
        ]),
        templates: vec!["postgresql".to_string()],
    }
}
