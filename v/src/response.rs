use actix_web::{http::StatusCode, HttpResponse};
use serde::Serialize;

/// 统一错误响应体 / Uniform error body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    /// 客户端是否可以原样重试 / Whether the caller may retry unchanged
    pub retry: bool,
}

// 结构体自动转 JSON，失败则原样文本
// Serialize to JSON, fall back to Debug text
pub fn respond_any<T: Serialize + std::fmt::Debug>(code: StatusCode, data: T) -> HttpResponse {
    match serde_json::to_value(&data) {
        Ok(v) => HttpResponse::build(code).json(v),
        Err(_) => HttpResponse::build(code)
            .content_type("text/plain; charset=utf-8")
            .body(format!("{:?}", data)),
    }
}

pub fn respond_error(code: StatusCode, error: impl Into<String>, retry: bool) -> HttpResponse {
    HttpResponse::build(code).json(ErrorBody {
        error: error.into(),
        retry,
    })
}
