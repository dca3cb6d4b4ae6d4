#![forbid(unsafe_code)]

use std::fs;

use log::error;
use poem::http::StatusCode;
use poem::web::{Data, Html, Json};
use poem::{handler, IntoResponse, Response};
use serde_json::{json, Value};
use tera::{Context, Tera};
use thiserror::Error;

// ***************************************************************************
//                                Constants
// ***************************************************************************
const PAGE_NOT_FOUND_MSG : &str = "Ошибка: index.html не найден!";
const PAGE_RENDER_MSG    : &str = "Ошибка: не удалось отобразить index.html!";

// ***************************************************************************
//                               Landing Page
// ***************************************************************************
#[derive(Error, Debug)]
pub enum PageError {
    #[error("unable to read landing page {0}: {1}")]
    NotFound(String, std::io::Error),

    #[error("unable to render landing page {0}: {1}")]
    Render(String, tera::Error),
}

/** The landing page template.  The file is read on every request so it can
 * be edited without restarting the server.
 */
#[derive(Debug, Clone)]
pub struct LandingPage {
    pub index_file: String,
    pub title: String,
}

impl LandingPage {
    pub fn new(index_file: String, title: String) -> Self {
        Self {index_file, title}
    }

    pub fn render(&self) -> Result<String, PageError> {
        let template = fs::read_to_string(&self.index_file)
            .map_err(|e| PageError::NotFound(self.index_file.clone(), e))?;

        let mut context = Context::new();
        context.insert("title", &self.title);
        Tera::one_off(&template, &context, false)
            .map_err(|e| PageError::Render(self.index_file.clone(), e))
    }
}

// ***************************************************************************
//                                 Handlers
// ***************************************************************************
// ---------------------------------------------------------------------------
// index:
// ---------------------------------------------------------------------------
#[handler]
pub fn index(Data(page): Data<&LandingPage>) -> Response {
    match page.render() {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            error!("{}", e);
            let msg = match e {
                PageError::NotFound(..) => PAGE_NOT_FOUND_MSG,
                PageError::Render(..) => PAGE_RENDER_MSG,
            };
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .content_type("text/plain; charset=utf-8")
                .body(msg)
        }
    }
}

// ---------------------------------------------------------------------------
// health:
// ---------------------------------------------------------------------------
#[handler]
pub fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

// ---------------------------------------------------------------------------
// favicon:
// ---------------------------------------------------------------------------
#[handler]
pub fn favicon() -> StatusCode {
    StatusCode::NO_CONTENT
}
