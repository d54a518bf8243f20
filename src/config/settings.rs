use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::env;
use std::sync::RwLock;

pub static GLOBAL_CONFIG: Lazy<Config> = Lazy::new(Config::new);

static DEFAULT_SEED_ADDR: &str = "127.0.0.1:5000";
static DEFAULT_KEYS_DIR: &str = "./keys";

const SEED_ADDRESS_KEY: &str = "SEED_ADDRESS";
const KEYS_DIR_KEY: &str = "KEYS_DIR";

pub struct Config {
    inner: RwLock<HashMap<String, String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Config {
        let mut seed_addr = String::from(DEFAULT_SEED_ADDR);
        if let Ok(addr) = env::var(SEED_ADDRESS_KEY) {
            seed_addr = addr;
        }

        let mut keys_dir = String::from(DEFAULT_KEYS_DIR);
        if let Ok(dir) = env::var(KEYS_DIR_KEY) {
            keys_dir = dir;
        }

        let mut map = HashMap::new();
        map.insert(String::from(SEED_ADDRESS_KEY), seed_addr);
        map.insert(String::from(KEYS_DIR_KEY), keys_dir);

        Config {
            inner: RwLock::new(map),
        }
    }

    pub fn get_seed_addr(&self) -> String {
        let inner = self
            .inner
            .read()
            .expect("Failed to acquire read lock on config - this should never happen");
        inner
            .get(SEED_ADDRESS_KEY)
            .expect("Seed address should always be present in config")
            .clone()
    }

    pub fn set_seed_addr(&self, addr: String) {
        let mut inner = self
            .inner
            .write()
            .expect("Failed to acquire write lock on config - this should never happen");
        inner.insert(String::from(SEED_ADDRESS_KEY), addr);
    }

    pub fn get_keys_dir(&self) -> String {
        let inner = self
            .inner
            .read()
            .expect("Failed to acquire read lock on config - this should never happen");
        inner
            .get(KEYS_DIR_KEY)
            .expect("Keys directory should always be present in config")
            .clone()
    }

    pub fn set_keys_dir(&self, dir: String) {
        let mut inner = self
            .inner
            .write()
            .expect("Failed to acquire write lock on config - this should never happen");
        inner.insert(String::from(KEYS_DIR_KEY), dir);
    }
}
