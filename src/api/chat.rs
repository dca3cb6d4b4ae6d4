#![forbid(unsafe_code)]

use std::sync::Arc;

use log::warn;
use poem::{Endpoint, EndpointExt, Request};
use poem_openapi::error::ParseRequestPayloadError;
use poem_openapi::{ OpenApi, payload::Json, Object, ApiResponse };
use serde_json::Value;

use crate::busya::gateway::{ChatGateway, ChatReply, ReplyBody};
use crate::utils::busya_utils::{self, RequestDebug};

// ***************************************************************************
//                          Request/Response Definitions
// ***************************************************************************
pub struct ChatApi {
    gateway: Arc<ChatGateway>,
}

impl ChatApi {
    pub fn new(gateway: Arc<ChatGateway>) -> Self {
        Self {gateway}
    }
}

// The request body is taken as raw json so that a missing or non-string
// message is answered with our own envelope rather than a framework error.
#[derive(Debug)]
struct ReqChat
{
    message: Option<String>,
}

impl ReqChat {
    fn from_json(body: &Value) -> Self {
        Self {message: body.get("message").and_then(Value::as_str).map(str::to_string)}
    }
}

// Implement the debug record trait for logging.
impl RequestDebug for ReqChat {
    fn get_request_info(&self) -> String {
        let mut s = String::with_capacity(255);
        s.push_str("  Request body:");
        s.push_str("\n    message: ");
        match &self.message {
            Some(m) => s.push_str(m),
            None => s.push_str("None"),
        }
        s.push('\n');
        s
    }
}

#[derive(Object, Debug)]
struct RespChat
{
    #[oai(skip_serializing_if_is_none)]
    response: Option<String>,
    #[oai(skip_serializing_if_is_none)]
    error: Option<String>,
    is_male_voice: bool,
}

impl RespChat {
    fn new(body: ReplyBody, is_male_voice: bool) -> Self {
        match body {
            ReplyBody::Response(r) => Self {response: Some(r), error: None, is_male_voice},
            ReplyBody::Error(e) => Self {response: None, error: Some(e), is_male_voice},
        }
    }
}

// ------------------- HTTP Status Codes -------------------
#[derive(Debug, ApiResponse)]
enum ChatResponse {
    #[oai(status = 200)]
    Http200(Json<RespChat>),
    #[oai(status = 400)]
    Http400(Json<RespChat>),
    #[oai(status = 500)]
    Http500(Json<RespChat>),
}

fn make_http_200(resp: RespChat) -> ChatResponse {
    ChatResponse::Http200(Json(resp))
}
fn make_http_400(resp: RespChat) -> ChatResponse {
    ChatResponse::Http400(Json(resp))
}
fn make_http_500(resp: RespChat) -> ChatResponse {
    ChatResponse::Http500(Json(resp))
}

fn make_response(reply: ChatReply) -> ChatResponse {
    let resp = RespChat::new(reply.body, reply.is_male_voice);
    match reply.status {
        200 => make_http_200(resp),
        400 => make_http_400(resp),
        _ => make_http_500(resp),
    }
}

// ***************************************************************************
//                             OpenAPI Endpoint
// ***************************************************************************
#[OpenApi]
impl ChatApi {
    /// Answer a chat message with a canned reply or a generated completion.
    #[oai(path = "/chat", method = "post")]
    async fn chat(&self, http_req: &Request, body: Json<Value>) -> ChatResponse {
        let req = ReqChat::from_json(&body.0);

        // Conditional logging depending on log level.
        busya_utils::debug_request(http_req, &req);

        make_response(self.gateway.handle_chat(req.message.as_deref()).await)
    }
}

// ---------------------------------------------------------------------------
// catch_unparsed_body:
// ---------------------------------------------------------------------------
/** Wrap the chat service so that a body that isn't json at all is answered
 * like a request with no message: the 400 envelope with the current voice
 * state, and no parser detail.
 */
pub fn catch_unparsed_body<E: Endpoint + 'static>(ep: E, gateway: Arc<ChatGateway>) -> impl Endpoint {
    ep.catch_error(move |err: ParseRequestPayloadError| {
        let gateway = gateway.clone();
        async move {
            warn!("Unable to parse chat request body: {}", err);
            make_response(gateway.handle_chat(None).await)
        }
    })
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
mod tests {
    use super::*;
    use poem::http::StatusCode;
    use poem::test::TestClient;
    use poem::{IntoEndpoint, Route};
    use poem_openapi::OpenApiService;
    use serde_json::json;

    use crate::busya::gateway::ChatSettings;
    use crate::busya::phrases::PhraseTable;
    use crate::busya::resolver::{MatchMode, ResponseResolver, VoiceState};

    fn app() -> impl Endpoint {
        let resolver = ResponseResolver::new(PhraseTable::default(), MatchMode::Substring,
                                             Arc::new(VoiceState::new()));
        let settings = ChatSettings {system_prompt: "persona".to_string(), temperature: 0.8, max_tokens: 500};
        let gateway = Arc::new(ChatGateway::new(resolver, None, settings));
        let api_service = OpenApiService::new(ChatApi::new(gateway.clone()), "Busya Server", "test");
        Route::new().nest("/api", catch_unparsed_body(api_service.into_endpoint(), gateway))
    }

    #[tokio::test]
    async fn non_json_body_is_400_envelope() {
        let cli = TestClient::new(app());
        let resp = cli.post("/api/chat")
            .content_type("application/json")
            .body("not json")
            .send()
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);
        resp.assert_json(json!({"error": "Пустое сообщение", "is_male_voice": false})).await;

        // The envelope reports the voice state as it stands.
        cli.post("/api/chat").body_json(&json!({"message": "смени голос"})).send().await
            .assert_status_is_ok();
        let resp = cli.post("/api/chat")
            .content_type("application/json")
            .body("{\"message\": ")
            .send()
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);
        resp.assert_json(json!({"error": "Пустое сообщение", "is_male_voice": true})).await;
    }

    #[tokio::test]
    async fn empty_message_is_400() {
        let cli = TestClient::new(app());
        let resp = cli.post("/api/chat").body_json(&json!({"message": ""})).send().await;
        resp.assert_status(StatusCode::BAD_REQUEST);
        resp.assert_json(json!({"error": "Пустое сообщение", "is_male_voice": false})).await;
    }

    #[tokio::test]
    async fn missing_or_non_string_message_is_400() {
        let cli = TestClient::new(app());
        for body in [json!({}), json!({"message": 42}), json!({"message": null}), json!(["hi"])] {
            let resp = cli.post("/api/chat").body_json(&body).send().await;
            resp.assert_status(StatusCode::BAD_REQUEST);
            resp.assert_json(json!({"error": "Пустое сообщение", "is_male_voice": false})).await;
        }
    }

    #[tokio::test]
    async fn canned_reply_is_200() {
        let cli = TestClient::new(app());
        let resp = cli.post("/api/chat").body_json(&json!({"message": "Кто ты?"})).send().await;
        resp.assert_status_is_ok();
        let body = resp.json().await;
        let value = body.value();
        assert!(value.object().get("response").string().starts_with("Приветик!"));
        value.object().get("is_male_voice").assert_bool(false);
    }

    #[tokio::test]
    async fn voice_state_persists_across_requests() {
        let cli = TestClient::new(app());
        let resp = cli.post("/api/chat").body_json(&json!({"message": "смени голос"})).send().await;
        resp.assert_json(json!({
            "response": "Хорошо, переключаюсь на мужской голос 🧑‍💻",
            "is_male_voice": true,
        })).await;

        let resp = cli.post("/api/chat").body_json(&json!({"message": "   "})).send().await;
        resp.assert_status(StatusCode::BAD_REQUEST);
        resp.assert_json(json!({"error": "Пустое сообщение", "is_male_voice": true})).await;

        let resp = cli.post("/api/chat").body_json(&json!({"message": "поменяй голос"})).send().await;
        resp.assert_json(json!({
            "response": "Хорошо, теперь женский голос 👩‍🎤",
            "is_male_voice": false,
        })).await;
    }

    #[tokio::test]
    async fn no_credential_is_500() {
        let cli = TestClient::new(app());
        let resp = cli.post("/api/chat").body_json(&json!({"message": "hello"})).send().await;
        resp.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        resp.assert_json(json!({
            "response": "⚠️ API ключ не настроен. Добавь его в .env!",
            "is_male_voice": false,
        })).await;
    }
}
