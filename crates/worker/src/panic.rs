use std::any::Any;

/// Extracts the message from a panic payload, if it carries one.
pub fn panic_message(payload: &(dyn Any + Send)) -> Option<String> {
	if let Some(msg) = payload.downcast_ref::<&'static str>() {
		Some((*msg).to_owned())
	} else {
		payload.downcast_ref::<String>().cloned()
	}
}
