#![forbid(unsafe_code)]

use anyhow::{Result, anyhow};
use log::{info, warn, error, LevelFilter};
use serde::Deserialize;
use std::{env, fmt, fs, path::Path};
use fs_mistrust::Mistrust;
use std::os::unix::fs::PermissionsExt;
use lazy_static::lazy_static;
use structopt::StructOpt;

use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Root};
use log4rs::encode::pattern::PatternEncoder;

// Busya Utilities
use crate::busya::phrases::PhraseTable;
use crate::busya::resolver::MatchMode;
use crate::utils::{busya_utils, errors::Errors};

// ***************************************************************************
//                                Constants
// ***************************************************************************
// Directory and file locations. Unless otherwise noted, all files and directories
// are relative to the root directory.
const ENV_BUSYA_ROOT_DIR   : &str = "BUSYA_ROOT_DIR";
const DEFAULT_ROOT_DIR     : &str = "~/.busya";
const CONFIG_DIR           : &str = "/config";
const LOGS_DIR             : &str = "/logs";
const CERTS_DIR            : &str = "/certs";
const LOG4RS_CONFIG_FILE   : &str = "/log4rs.yml";  // relative to config dir
const BUSYA_CONFIG_FILE    : &str = "/busya.toml";  // relative to config dir
const PHRASES_FILE         : &str = "/phrases.toml"; // relative to config dir

// Credential.
const ENV_OPENAI_API_KEY   : &str = "OPENAI_API_KEY";

// Networking.
const DEFAULT_HTTP_ADDR    : &str = "http://localhost";
const DEFAULT_HTTP_PORT    : u16  = 5000;
const DEFAULT_BIND_ADDR    : &str = "0.0.0.0";
const DEFAULT_INDEX_FILE   : &str = "index.html";

// Completion provider.
const DEFAULT_API_BASE     : &str = "https://api.openai.com/v1";
const DEFAULT_MODEL        : &str = "gpt-3.5-turbo";
const DEFAULT_TEMPERATURE  : f32  = 0.8;
const DEFAULT_MAX_TOKENS   : u32  = 500;
const DEFAULT_TIMEOUT_SECS : u64  = 30;
pub const DEFAULT_SYSTEM_PROMPT : &str =
    "Ты — Busya-AI, милая, вежливая ИИ-девочка с чувством юмора ^_^ Отвечай по-русски, дружелюбно и с каваимодзи.";

// Console logging used when no log4rs file is installed.
const CONSOLE_LOG_PATTERN  : &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} {h({l})} {t} - {m}{n}";

// ***************************************************************************
//                             Static Variables
// ***************************************************************************
// Assign the command line arguments BEFORE the runtime context is initialized in main.
lazy_static! {
    pub static ref BUSYA_ARGS: BusyaArgs = init_busya_args();
}

// ***************************************************************************
//                             Directory Structs
// ***************************************************************************
// ---------------------------------------------------------------------------
// BusyaDirs:
// ---------------------------------------------------------------------------
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct BusyaDirs {
    pub root_dir: String,
    pub config_dir: String,
    pub logs_dir: String,
    pub certs_dir: String,
}

// ***************************************************************************
//                               Config Structs
// ***************************************************************************
// ---------------------------------------------------------------------------
// BusyaArgs:
// ---------------------------------------------------------------------------
#[derive(Debug, StructOpt)]
#[structopt(name = "busya_args", about = "Command line arguments for Busya Server.")]
pub struct BusyaArgs {
    /// Specify Busya's root data directory.
    ///
    /// This directory contains the configuration, log and certificate
    /// directories used during execution.
    #[structopt(short, long)]
    pub root_dir: Option<String>,

    /// Create the data directories and then exit.
    ///
    /// The data directories will be rooted at a root directory calculated
    /// using the following priority order:
    ///
    ///   1. If set, the value of the BUSYA_ROOT_DIR environment,
    ///
    ///   2. Otherwise, if set, the value of the --root_dir command line argument,
    ///
    ///   3. Otherwise, ~/.busya
    ///
    #[structopt(short, long)]
    pub create_dirs_only: bool,
}

// ---------------------------------------------------------------------------
// Parms:
// ---------------------------------------------------------------------------
#[derive(Debug)]
#[allow(dead_code)]
pub struct Parms {
    pub config_file: String,
    pub config: Config,
}

// ---------------------------------------------------------------------------
// Credential:
// ---------------------------------------------------------------------------
/** The completion provider's api key.  Debug output only reveals the length. */
#[derive(Clone)]
pub struct Credential(String);

impl Credential {
    /// Blank values are treated as a missing key.
    pub fn new(key: &str) -> Option<Self> {
        let key = key.trim();
        if key.is_empty() {None} else {Some(Self(key.to_string()))}
    }

    pub fn secret(&self) -> &str {
        &self.0
    }

    pub fn key_len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Credential(len={})", self.0.len())
    }
}

// ---------------------------------------------------------------------------
// RuntimeCtx:
// ---------------------------------------------------------------------------
#[derive(Debug)]
#[allow(dead_code)]
pub struct RuntimeCtx {
    pub parms: Parms,
    pub phrases: PhraseTable,
    pub credential: Option<Credential>,
    pub busya_args: &'static BusyaArgs,
    pub busya_dirs: BusyaDirs,
}

// ---------------------------------------------------------------------------
// Config:
// ---------------------------------------------------------------------------
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub title: String,
    pub http_addr: String,
    pub http_port: u16,
    pub bind_addr: String,
    pub index_file: String,
    pub enable_tls: bool,
    pub match_mode: MatchMode,
    pub provider: ProviderConfig,
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            title: "Busya-AI".to_string(),
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            index_file: DEFAULT_INDEX_FILE.to_string(),
            enable_tls: false,
            match_mode: MatchMode::default(),
            provider: ProviderConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProviderConfig:
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub api_base: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub retry_transient: bool,
    pub system_prompt: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            retry_transient: false,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

// ***************************************************************************
//                            Directory Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// init_busya_args:
// ---------------------------------------------------------------------------
/** Get the command line arguments. */
fn init_busya_args() -> BusyaArgs {
    let args = BusyaArgs::from_args();
    println!("{:?}", args);
    args
}

// ---------------------------------------------------------------------------
// init_busya_dirs:
// ---------------------------------------------------------------------------
/** Calculate the external data directories, creating any that don't exist. */
pub fn init_busya_dirs() -> Result<BusyaDirs> {
    // Initialize the mistrust object.
    let mistrust = get_mistrust()?;

    // Check that each path is absolute and is a directory with the
    // proper permission assign if it exists.  If it doesn't exist,
    // create it.
    let root_dir = get_root_dir();
    check_busya_dir(&root_dir, "root directory", &mistrust)?;

    let config_dir = root_dir.clone() + CONFIG_DIR;
    check_busya_dir(&config_dir, "config directory", &mistrust)?;

    let logs_dir = root_dir.clone() + LOGS_DIR;
    check_busya_dir(&logs_dir, "logs directory", &mistrust)?;

    let certs_dir = root_dir.clone() + CERTS_DIR;
    check_busya_dir(&certs_dir, "certs directory", &mistrust)?;

    Ok(BusyaDirs {root_dir, config_dir, logs_dir, certs_dir})
}

// ---------------------------------------------------------------------------
// check_busya_dir:
// ---------------------------------------------------------------------------
/** Check that the path is absolute and, if it exists, that is has the proper
 * permissions assigned.  If it doesn't exist, create it.  The mistrust package
 * creates directories with 0o700 permissions.
 */
fn check_busya_dir(dir: &str, msgname: &str, mistrust: &Mistrust) -> Result<()> {
    let path = Path::new(dir);
    if !path.is_absolute() {
        return Err(anyhow!(Errors::DataDirectory(format!("the {} path must be absolute: {}", msgname, dir))));
    }
    if path.exists() {
        // Make sure the path represents a directory.
        if !path.is_dir() {
            return Err(anyhow!(Errors::DataDirectory(format!("the {} path must be a directory: {}", msgname, dir))));
        }

        // Make sure the directory has rwx for owner only.
        let perm = path.metadata()?.permissions().mode();
        if perm & 0o777 != 0o700 {
            return Err(anyhow!(Errors::DataDirectory(format!("the {} path must have 0o700 permissions: {}", msgname, dir))));
        }
    } else if let Err(e) = mistrust.make_directory(path) {
        return Err(anyhow!(Errors::DataDirectory(format!("make directory error for {:?}: {}", path, e))));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// get_mistrust:
// ---------------------------------------------------------------------------
/** Configure a new mistrust object for initial directory processing. */
fn get_mistrust() -> Result<Mistrust> {
    match Mistrust::builder()
        .ignore_prefix(busya_utils::get_absolute_path("~"))
        .trust_group(0)
        .build() {
            Ok(m) => Ok(m),
            Err(e) => Err(anyhow!(Errors::BusyaError(format!("Mistrust configuration error: {}", e)))),
        }
}

// ---------------------------------------------------------------------------
// get_root_dir:
// ---------------------------------------------------------------------------
fn get_root_dir() -> String {
    // Order of precedence:
    //  1. Environment variable
    //  2. Command line --root-dir argument
    //  3. Default location
    //
    let root_dir = env::var(ENV_BUSYA_ROOT_DIR).unwrap_or_else(
        |_| {
            match BUSYA_ARGS.root_dir.clone() {
                Some(r) => r,
                None => DEFAULT_ROOT_DIR.to_string(),
            }
        });

    // Canonicalize the path.
    busya_utils::get_absolute_path(&root_dir)
}

// ***************************************************************************
//                               Log Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// init_log:
// ---------------------------------------------------------------------------
/** Initialize log4rs from the config directory's log4rs.yml.  Without that
 * file we log to the console at info level.
 */
pub fn init_log(dirs: &BusyaDirs) -> Result<()> {
    let logconfig = dirs.config_dir.clone() + LOG4RS_CONFIG_FILE;
    if Path::new(&logconfig).exists() {
        if let Err(e) = log4rs::init_file(&logconfig, Default::default()) {
            println!("{}", e);
            return Err(anyhow!(Errors::Log4rsInitialization(logconfig)));
        }
        info!("Log4rs initialized using: {}", logconfig);
    } else {
        let stdout = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(CONSOLE_LOG_PATTERN)))
            .build();
        let config = log4rs::config::Config::builder()
            .appender(Appender::builder().build("stdout", Box::new(stdout)))
            .build(Root::builder().appender("stdout").build(LevelFilter::Info))?;
        log4rs::init_config(config)?;
        info!("Log4rs configuration {} not found, logging to console.", logconfig);
    }
    Ok(())
}

// ***************************************************************************
//                             Parms Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// get_parms:
// ---------------------------------------------------------------------------
/** Retrieve the application parameters from the configuration file in the
 * config directory.  A missing file means all default values.
 */
fn get_parms(dirs: &BusyaDirs) -> Result<Parms> {
    let config_file = dirs.config_dir.clone() + BUSYA_CONFIG_FILE;

    // Read the configuration file.
    info!("{}", Errors::ReadingConfigFile(config_file.clone()));
    let contents = match fs::read_to_string(&config_file) {
        Ok(c) => c,
        Err(_) => {
            info!("Unable to read configuration at {}. Using default values.", config_file);
            return Ok(Parms { config_file: Default::default(), config: Config::new() });
        }
    };

    let config = parse_config(&contents, &config_file)?;
    Ok(Parms { config_file, config })
}

// ---------------------------------------------------------------------------
// parse_config:
// ---------------------------------------------------------------------------
fn parse_config(contents: &str, config_file: &str) -> Result<Config> {
    match toml::from_str(contents) {
        Ok(c)  => Ok(c),
        Err(e) => {
            let msg = format!("{}\n   {}", Errors::TOMLParseError(config_file.to_string()), e);
            error!("{}", msg);
            Err(anyhow!(msg))
        }
    }
}

// ---------------------------------------------------------------------------
// get_phrases:
// ---------------------------------------------------------------------------
fn get_phrases(dirs: &BusyaDirs) -> Result<PhraseTable> {
    let phrases_file = dirs.config_dir.clone() + PHRASES_FILE;
    if !Path::new(&phrases_file).exists() {
        info!("No phrase file at {}, using built-in phrases.", phrases_file);
        return Ok(PhraseTable::default());
    }

    let contents = fs::read_to_string(&phrases_file)?;
    let table = PhraseTable::from_toml(&contents)
        .map_err(|e| anyhow!("{}: {}", Errors::TOMLParseError(phrases_file.clone()), e))?;
    info!("Loaded {} phrase rules from {}.", table.rule_count(), phrases_file);
    Ok(table)
}

// ---------------------------------------------------------------------------
// load_credential:
// ---------------------------------------------------------------------------
/** Read the provider key from the environment.  The caller is expected to
 * have loaded any .env file first.
 */
pub fn load_credential() -> Option<Credential> {
    let credential = env::var(ENV_OPENAI_API_KEY).ok().and_then(|k| Credential::new(&k));
    match &credential {
        Some(c) => info!("{} loaded, length: {}", ENV_OPENAI_API_KEY, c.key_len()),
        None => warn!("{} not found! Add it to the .env file ({}=...). \
                       Requests not answered by a canned phrase will fail.",
                      ENV_OPENAI_API_KEY, ENV_OPENAI_API_KEY),
    }
    credential
}

// ***************************************************************************
//                             Config Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// init_runtime_context:
// ---------------------------------------------------------------------------
/** Read every input the server needs.  Logging must already be initialized. */
pub fn init_runtime_context(busya_dirs: BusyaDirs) -> Result<RuntimeCtx> {
    let parms = get_parms(&busya_dirs)?;
    let phrases = get_phrases(&busya_dirs)?;
    let credential = load_credential();
    Ok(RuntimeCtx {parms, phrases, credential, busya_args: &BUSYA_ARGS, busya_dirs})
}
