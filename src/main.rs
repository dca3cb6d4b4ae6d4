#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use log::{info, error};
use poem::listener::{Listener, RustlsCertificate, RustlsConfig};
use poem::middleware::Cors;
use poem::{get, listener::TcpListener, EndpointExt, IntoEndpoint, Route};
use poem_openapi::OpenApiService;

// Busya Utilities
use crate::api::chat::{self, ChatApi};
use crate::api::pages::{self, LandingPage};
use crate::busya::gateway::{ChatGateway, ChatSettings};
use crate::busya::provider::{CompletionProvider, OpenAiClient};
use crate::busya::resolver::{ResponseResolver, VoiceState};
use crate::utils::busya_utils::get_absolute_path;
use crate::utils::config::{init_busya_dirs, init_log, init_runtime_context, RuntimeCtx, BUSYA_ARGS};
use crate::utils::errors::Errors;

// Modules
mod api;
mod busya;
mod utils;

// ***************************************************************************
//                                Constants
// ***************************************************************************
const SERVER_NAME : &str = "BusyaServer"; // for poem logging
const CERT_FILE   : &str = "/cert.pem";   // relative to certs dir
const KEY_FILE    : &str = "/key.pem";    // relative to certs dir

// ---------------------------------------------------------------------------
// main:
// ---------------------------------------------------------------------------
#[tokio::main]
async fn main() -> Result<()> {
    // --------------- Initialize Busya ---------------
    // Announce ourselves.
    println!("Starting busya_server!");

    // Initialize the server.
    let runtime_ctx = match busya_init()? {
        Some(ctx) => ctx,
        None => return Ok(()),
    };
    let config = &runtime_ctx.parms.config;

    // --------------- Main Loop Set Up ---------------
    // Assign base URL.
    let busya_url = format!("{}:{}{}", config.http_addr, config.http_port, "/api");

    let gateway = Arc::new(build_gateway(&runtime_ctx)?);
    let api_service =
        OpenApiService::new(ChatApi::new(gateway.clone()), config.title.as_str(), env!("CARGO_PKG_VERSION"))
        .server(busya_url);

    // Allow the generated openapi specs to be retrieved from the server.
    let spec = api_service.spec_endpoint();
    let spec_yaml = api_service.spec_endpoint_yaml();
    let ui = api_service.swagger_ui();

    // The landing page path is resolved once against our working directory.
    let page = LandingPage::new(get_absolute_path(&config.index_file), config.title.clone());

    // Create the routes and run the server.
    let addr = format!("{}:{}", config.bind_addr, config.http_port);
    let app = Route::new()
        .at("/", get(pages::index))
        .at("/health", get(pages::health))
        .at("/favicon.ico", get(pages::favicon))
        .nest("/api", chat::catch_unparsed_body(api_service.into_endpoint(), gateway))
        .nest("/swagger", ui)
        .at("/spec", spec)
        .at("/spec_yaml", spec_yaml)
        .data(page)
        .with(Cors::new());

    // ------------------ Main Loop -------------------
    info!("Listening on {} (tls={}).", addr, config.enable_tls);
    if config.enable_tls {
        let certs_dir = &runtime_ctx.busya_dirs.certs_dir;
        poem::Server::new(
            TcpListener::bind(addr).rustls(
                RustlsConfig::new().fallback(
                    RustlsCertificate::new()
                        .key(std::fs::read(certs_dir.clone() + KEY_FILE)?)
                        .cert(std::fs::read(certs_dir.clone() + CERT_FILE)?),
                ),
            ),
        )
        .name(SERVER_NAME)
        .run(app)
        .await?;
    } else {
        poem::Server::new(TcpListener::bind(addr))
            .name(SERVER_NAME)
            .run(app)
            .await?;
    }
    Ok(())
}

// ***************************************************************************
//                             Private Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// busya_init:
// ---------------------------------------------------------------------------
/** Initialize all subsystems and read the runtime context.  None is returned
 * when the user only asked for the data directories to be created.
 */
fn busya_init() -> Result<Option<RuntimeCtx>> {
    // Load a .env file from the working directory if there is one.
    let dotenv = dotenvy::dotenv();

    // Create or check the data directories.
    let busya_dirs = init_busya_dirs()?;
    if BUSYA_ARGS.create_dirs_only {
        println!("Busya data directories created under {}", busya_dirs.root_dir);
        return Ok(None);
    }

    // Configure our log.
    init_log(&busya_dirs)?;
    match dotenv {
        Ok(path) => info!("Environment loaded from {:?}.", path),
        Err(e) => info!("No .env file loaded: {}", e),
    }

    let runtime_ctx = init_runtime_context(busya_dirs)?;
    info!("{}", Errors::InputParms(format!("{:#?}", runtime_ctx)));

    // Log build info.
    print_version_info();

    Ok(Some(runtime_ctx))
}

// ---------------------------------------------------------------------------
// build_gateway:
// ---------------------------------------------------------------------------
/** Assemble the chat gateway.  Without a credential the gateway still serves
 * canned replies and reports every other message as not configured.
 */
fn build_gateway(runtime_ctx: &RuntimeCtx) -> Result<ChatGateway> {
    let config = &runtime_ctx.parms.config;
    let resolver = ResponseResolver::new(runtime_ctx.phrases.clone(), config.match_mode,
                                         Arc::new(VoiceState::new()));

    let provider: Option<Arc<dyn CompletionProvider>> = match &runtime_ctx.credential {
        Some(credential) => match OpenAiClient::new(&config.provider, credential.clone()) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                error!("Unable to create the completion client: {}", e);
                return Err(e.into());
            }
        },
        None => None,
    };

    let settings = ChatSettings {
        system_prompt: config.provider.system_prompt.clone(),
        temperature: config.provider.temperature,
        max_tokens: config.provider.max_tokens,
    };
    Ok(ChatGateway::new(resolver, provider, settings))
}

// ---------------------------------------------------------------------------
// print_version_info:
// ---------------------------------------------------------------------------
fn print_version_info() {
    info!("\n*** Running BUSYA={}, BRANCH={}, COMMIT={}, DIRTY={}, SRC_TS={}, RUSTC={}.",
          option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"),
          env!("GIT_BRANCH"),
          env!("GIT_COMMIT_SHORT"),
          env!("GIT_DIRTY"),
          env!("SOURCE_TIMESTAMP"),
          env!("RUSTC_VERSION"));
}
