use serde_derive::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_PORT: u16 = 28008;

#[derive(Serialize, Deserialize)]
pub struct ServerSection {
    pub port: u16,
    pub fps: u32,
}

#[derive(Serialize, Deserialize)]
pub struct ClientSection {
    pub server: String,
    pub port: u16,
    pub fps: u32,
    pub user: String,
}

#[derive(Serialize, Deserialize)]
pub struct SimConfig {
    pub server: ServerSection,
    pub client: ClientSection,
}

impl Default for SimConfig {
    fn default() -> SimConfig {
        SimConfig {
            server: ServerSection {
                port: DEFAULT_PORT,
                fps: 20,
            },
            client: ClientSection {
                server: "localhost".to_string(),
                port: DEFAULT_PORT,
                fps: 20,
                user: String::new(),
            },
        }
    }
}

impl SimConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> SimConfig {
        serdeconv::from_toml_file(path).expect("Error loading simulation configuration file")
    }
}
