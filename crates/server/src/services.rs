//! Demo methods served by `cqrpc serve`.

use cqrpc::{DispatcherBuilder, HandlerError, RequestEnvelope, ResponseEnvelope};

/// Registers every demo method on `builder`.
pub(crate) fn register(builder: DispatcherBuilder) -> DispatcherBuilder {
	builder
		.unary("upper", upper)
		.unary("greet", |request: RequestEnvelope| greet("Hello ", request))
		.unary("greet_again", |request: RequestEnvelope| greet("Hello Again and Again ", request))
		.unary("reject", reject)
		.streaming("upper_stream", upper)
}

fn text(request: &RequestEnvelope) -> Result<&str, HandlerError> {
	request.payload_str().ok_or_else(|| HandlerError::invalid_argument("payload is not UTF-8"))
}

fn upper(request: RequestEnvelope) -> Result<ResponseEnvelope, HandlerError> {
	let upper = text(&request)?.to_uppercase();
	Ok(ResponseEnvelope::ok(request.id, upper))
}

fn greet(prefix: &str, request: RequestEnvelope) -> Result<ResponseEnvelope, HandlerError> {
	let greeting = format!("{prefix}{}", text(&request)?);
	Ok(ResponseEnvelope::ok(request.id, greeting))
}

fn reject(request: RequestEnvelope) -> Result<ResponseEnvelope, HandlerError> {
	Err(HandlerError::invalid_argument(format!("request {} rejected", request.id)))
}
