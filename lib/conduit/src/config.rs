use crate::buffer::PoolTuning;
use crate::flow::FlowTuning;
use serde_derive::{Deserialize, Serialize};
use std::path::Path;

/// Identity of this router within the mesh.
#[derive(Serialize, Deserialize)]
pub struct Router {
    pub id: String,
    /// Interior routers append themselves to the trace; edge routers do
    /// not.
    pub interior: bool,
}

/// Q2/Q3 watermark overrides, in buffers.
#[derive(Serialize, Deserialize)]
pub struct Flow {
    pub q2_upper: usize,
    pub q2_lower: usize,
    pub q3_upper: usize,
    pub q3_lower: usize,
}

/// Buffer pool tuning.
#[derive(Serialize, Deserialize)]
pub struct Pool {
    pub transfer_batch_size: usize,
    pub local_free_list_max: usize,
    pub global_free_list_max: usize,
}

#[derive(Serialize, Deserialize)]
pub struct Message {
    /// Zero means unlimited.
    pub max_message_size: u64,
}

#[derive(Serialize, Deserialize)]
pub struct Http {
    /// Address ingress requests are routed to.
    pub virtual_address: String,
}

#[derive(Serialize, Deserialize)]
pub struct RouterConfig {
    pub router: Router,
    pub flow: Flow,
    pub pool: Pool,
    pub message: Message,
    pub http: Http,
}

impl Default for RouterConfig {
    fn default() -> RouterConfig {
        let flow = FlowTuning::default();
        let pool = PoolTuning::default();

        RouterConfig {
            router: Router {
                id: "router-0".to_string(),
                interior: true,
            },
            flow: Flow {
                q2_upper: flow.q2_upper,
                q2_lower: flow.q2_lower,
                q3_upper: flow.q3_upper,
                q3_lower: flow.q3_lower,
            },
            pool: Pool {
                transfer_batch_size: pool.transfer_batch_size,
                local_free_list_max: pool.local_free_list_max,
                global_free_list_max: pool.global_free_list_max,
            },
            message: Message { max_message_size: 0 },
            http: Http {
                virtual_address: "http2/ingress".to_string(),
            },
        }
    }
}

impl RouterConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> RouterConfig {
        serdeconv::from_toml_file(path).expect("Error loading router configuration file")
    }

    pub fn from_toml(toml: &str) -> RouterConfig {
        serdeconv::from_toml_str(toml).expect("Error parsing router configuration")
    }

    /// Install the tunables. Call during single-threaded startup, before
    /// worker threads allocate or open sessions.
    pub fn apply(&self) {
        crate::buffer::tune_pool(PoolTuning {
            transfer_batch_size: self.pool.transfer_batch_size,
            local_free_list_max: self.pool.local_free_list_max,
            global_free_list_max: self.pool.global_free_list_max,
        });

        crate::flow::tune_flow(FlowTuning {
            q2_upper: self.flow.q2_upper,
            q2_lower: self.flow.q2_lower,
            q3_upper: self.flow.q3_upper,
            q3_lower: self.flow.q3_lower,
        });
    }

    /// The trace id of this router, when it participates in traces.
    pub fn local_trace_id(&self) -> Option<&str> {
        match self.router.interior {
            true => Some(&self.router.id),
            false => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_round_trips_through_toml() {
        let config = RouterConfig::default();
        let toml = serdeconv::to_toml_string(&config).unwrap();
        let loaded = RouterConfig::from_toml(&toml);

        assert_eq!(loaded.router.id, config.router.id);
        assert_eq!(loaded.flow.q2_upper, config.flow.q2_upper);
        assert_eq!(loaded.flow.q3_lower, config.flow.q3_lower);
        assert_eq!(loaded.pool.transfer_batch_size, config.pool.transfer_batch_size);
        assert_eq!(loaded.message.max_message_size, 0);
    }

    #[test]
    fn test_overrides_parse() {
        let config = RouterConfig::from_toml(
            r#"
[router]
id = "R7"
interior = false

[flow]
q2_upper = 16
q2_lower = 8
q3_upper = 64
q3_lower = 32

[pool]
transfer_batch_size = 8
local_free_list_max = 32
global_free_list_max = 256

[message]
max_message_size = 1048576

[http]
virtual_address = "closest/http"
"#,
        );

        assert_eq!(config.router.id, "R7");
        assert_eq!(config.local_trace_id(), None);
        assert_eq!(config.flow.q2_upper, 16);
        assert_eq!(config.message.max_message_size, 1_048_576);
        assert_eq!(config.http.virtual_address, "closest/http");
    }

    #[test]
    fn test_interior_router_has_trace_id() {
        let config = RouterConfig::default();
        assert_eq!(config.local_trace_id(), Some("router-0"));
    }

    #[test]
    #[should_panic(expected = "Error parsing router configuration")]
    fn test_malformed_config_fails() {
        let _ = RouterConfig::from_toml("[router");
    }
}
