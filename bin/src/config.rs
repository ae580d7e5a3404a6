//! elector runner configs

pub mod cli {
    //! Parse from either cli or env var

    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "elector-worker";
    /// default role namespace
    pub static DEFAULT_NAMESPACE: &str = "default";
    /// default role name
    pub static DEFAULT_NAME: &str = "elector";
    /// default log level. Can use this argument or ELECTOR_LOG env var
    pub const DEFAULT_ELECTOR_LOG: &str = "info";
    /// log as "json", "pretty" or "standard" (unstructured)
    pub const DEFAULT_LOG_FORMAT: &str = "standard";
    /// how often the singleton worker reports while leading, in ms
    pub const DEFAULT_WORK_INTERVAL: u64 = 1_000;

    use std::{path::PathBuf, time::Duration};

    use anyhow::{Context, Result, bail};
    pub use clap::Parser;
    use clap::ValueEnum;
    use leader_election::{BackendConfig, ElectionConfig, NatsConfig, Role, TimingsConfig};

    /// Which lock backend to compete on when no config file is given.
    #[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Backend {
        Nats,
        Memory,
    }

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "elector", bin_name = "elector", about, long_about = None)]
    /// parses from cli & environment var. elector will load `.env` in the same dir as the binary as well
    pub struct Config {
        /// path to a yaml election config. When set, role and backend flags are ignored
        #[clap(short, long, value_parser, env)]
        pub config_path: Option<PathBuf>,
        /// namespace of the contested role
        #[clap(long, env = "ELECTOR_NAMESPACE", value_parser, default_value = DEFAULT_NAMESPACE)]
        pub namespace: String,
        /// name of the contested role
        #[clap(long, env = "ELECTOR_NAME", value_parser, default_value = DEFAULT_NAME)]
        pub name: String,
        /// identity written into the lease; generated from the hostname when unset
        #[clap(long, env = "ELECTOR_IDENTITY", value_parser)]
        pub identity: Option<String>,
        /// lock backend
        #[clap(long, env = "ELECTOR_BACKEND", value_enum, default_value_t = Backend::Memory)]
        pub backend: Backend,
        /// NATS servers for the nats backend, comma separated
        #[clap(long, env, value_delimiter = ',')]
        pub nats_servers: Vec<String>,
        /// singleton work report interval in ms, at least 1
        #[clap(
            long,
            env,
            value_parser = clap::value_parser!(u64).range(1..),
            default_value_t = DEFAULT_WORK_INTERVAL
        )]
        pub work_interval: u64,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_ELECTOR_LOG)]
        pub elector_log: String,
        /// log output format: standard, json or pretty
        #[clap(long, env = "LOG_FORMAT", value_parser, default_value = DEFAULT_LOG_FORMAT)]
        pub log_format: String,
        /// number of tokio worker threads, defaults to the number of logical CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
    }

    impl Config {
        /// Create work interval as `Duration`
        pub fn work_interval(&self) -> Duration {
            Duration::from_millis(self.work_interval)
        }

        /// Load the election config from `config_path`, or assemble one from
        /// flags. `--identity` overrides the file's identity either way.
        pub fn election_config(&self) -> Result<ElectionConfig> {
            let mut cfg = match &self.config_path {
                Some(path) => {
                    let raw = std::fs::read_to_string(path)
                        .with_context(|| format!("failed to read config {}", path.display()))?;
                    serde_yaml::from_str::<ElectionConfig>(&raw)
                        .with_context(|| format!("failed to parse config {}", path.display()))?
                }
                None => ElectionConfig {
                    role: Role::new(self.namespace.clone(), self.name.clone()),
                    identity: None,
                    backend: self.backend_config()?,
                    timings: TimingsConfig::default(),
                },
            };
            if self.identity.is_some() {
                cfg.identity = self.identity.clone();
            }
            Ok(cfg)
        }

        fn backend_config(&self) -> Result<BackendConfig> {
            match self.backend {
                Backend::Memory => Ok(BackendConfig::Memory),
                Backend::Nats if self.nats_servers.is_empty() => {
                    bail!("--backend nats requires --nats-servers")
                }
                Backend::Nats => Ok(BackendConfig::Nats(NatsConfig::new(
                    self.nats_servers.clone(),
                ))),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_defaults() {
            let cfg = Config::try_parse_from(["elector"]).unwrap();
            assert_eq!(cfg.backend, Backend::Memory);
            assert_eq!(cfg.log_format, DEFAULT_LOG_FORMAT);
            assert_eq!(cfg.work_interval(), Duration::from_secs(1));

            let election = cfg.election_config().unwrap();
            assert_eq!(election.role, Role::new(DEFAULT_NAMESPACE, DEFAULT_NAME));
            assert_eq!(election.backend, BackendConfig::Memory);
            assert_eq!(election.identity, None);
        }

        #[test]
        fn test_nats_from_flags() {
            let cfg = Config::try_parse_from([
                "elector",
                "--backend",
                "nats",
                "--nats-servers",
                "nats://a:4222,nats://b:4222",
                "--namespace",
                "dhcp",
                "--name",
                "lease-gc",
                "--identity",
                "node-a",
            ])
            .unwrap();
            let election = cfg.election_config().unwrap();
            assert_eq!(election.role, Role::new("dhcp", "lease-gc"));
            assert_eq!(election.identity.as_deref(), Some("node-a"));
            let BackendConfig::Nats(nats) = election.backend else {
                panic!("expected nats backend");
            };
            assert_eq!(nats.servers, vec!["nats://a:4222", "nats://b:4222"]);
        }

        #[test]
        fn test_zero_work_interval_rejected() {
            assert!(Config::try_parse_from(["elector", "--work-interval", "0"]).is_err());
            let cfg = Config::try_parse_from(["elector", "--work-interval", "1"]).unwrap();
            assert_eq!(cfg.work_interval(), Duration::from_millis(1));
        }

        #[test]
        fn test_nats_requires_servers() {
            let cfg = Config::try_parse_from(["elector", "--backend", "nats"]).unwrap();
            assert!(cfg.election_config().is_err());
        }

        #[test]
        fn test_config_file_with_identity_override() {
            let path = std::env::temp_dir().join(format!(
                "elector-config-{}.yaml",
                std::process::id()
            ));
            std::fs::write(
                &path,
                "role: {namespace: dhcp, name: lease-gc}\nidentity: from-file\nbackend: {type: memory}\n",
            )
            .unwrap();

            let file_only = Config::try_parse_from([
                "elector",
                "--config-path",
                path.to_str().unwrap(),
            ])
            .unwrap();
            assert_eq!(
                file_only.election_config().unwrap().identity.as_deref(),
                Some("from-file")
            );

            let overridden = Config::try_parse_from([
                "elector",
                "-c",
                path.to_str().unwrap(),
                "--identity",
                "from-flag",
            ])
            .unwrap();
            let election = overridden.election_config().unwrap();
            std::fs::remove_file(&path).unwrap();
            assert_eq!(election.role, Role::new("dhcp", "lease-gc"));
            assert_eq!(election.identity.as_deref(), Some("from-flag"));
        }

        #[test]
        fn test_missing_config_file() {
            let cfg = Config::try_parse_from([
                "elector",
                "--config-path",
                "/nonexistent/elector.yaml",
            ])
            .unwrap();
            assert!(cfg.election_config().is_err());
        }
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    /// Configuration for log output
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber
        pub fn parse(elector_log: &str, log_frmt: &str) -> Result<Self> {
            // Log level comes from ELECTOR_LOG
            let filter = EnvFilter::try_new(elector_log).or_else(|_| EnvFilter::try_new("info"))?;

            match log_frmt {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self {
                log_frmt: log_frmt.to_owned(),
            })
        }
    }
}
