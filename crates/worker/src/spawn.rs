use std::any::Any;
use std::future::Future;
use std::sync::OnceLock;

use tokio::task::{JoinError, JoinHandle};

fn runtime_handle() -> tokio::runtime::Handle {
	if let Ok(handle) = tokio::runtime::Handle::try_current() {
		return handle;
	}

	static GLOBAL_RT: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
	let runtime = GLOBAL_RT.get_or_init(|| {
		tokio::runtime::Builder::new_multi_thread()
			.enable_all()
			.worker_threads(2)
			.thread_name("kiln-worker-global")
			.build()
			.unwrap_or_else(|err| panic!("failed to build kiln-worker global tokio runtime: {err}"))
	});
	runtime.handle().clone()
}

/// Spawns an async task, entering the ambient runtime or the shared fallback.
pub fn spawn<F>(label: &'static str, fut: F) -> JoinHandle<F::Output>
where
	F: Future + Send + 'static,
	F::Output: Send + 'static,
{
	tracing::trace!(label, "worker.spawn");
	runtime_handle().spawn(fut)
}

/// Spawns blocking work (disk reads, encoding) off the async workers.
pub fn spawn_blocking<F, R>(label: &'static str, f: F) -> JoinHandle<R>
where
	F: FnOnce() -> R + Send + 'static,
	R: Send + 'static,
{
	tracing::trace!(label, "worker.spawn_blocking");
	runtime_handle().spawn_blocking(f)
}

/// Extracts the panic message from a [`JoinError`], or `None` if the task was
/// cancelled rather than panicked.
pub fn join_error_panic_message(err: JoinError) -> Option<String> {
	err.try_into_panic().ok().map(|payload| panic_payload_message(payload.as_ref()))
}

fn panic_payload_message(payload: &(dyn Any + Send)) -> String {
	if let Some(msg) = payload.downcast_ref::<&'static str>() {
		(*msg).to_string()
	} else if let Some(msg) = payload.downcast_ref::<String>() {
		msg.clone()
	} else {
		"<non-string panic payload>".to_string()
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[tokio::test]
	async fn panic_message_from_str_payload() {
		let err = spawn("test", async { panic!("kiln-str") }).await.unwrap_err();
		let msg = join_error_panic_message(err).expect("should be a panic");
		assert!(msg.contains("kiln-str"), "got: {msg}");
	}

	#[tokio::test]
	async fn panic_message_from_formatted_payload() {
		let key = 7;
		let err = spawn("test", async move { panic!("analyzer failed for {key}") }).await.unwrap_err();
		assert_eq!(join_error_panic_message(err).as_deref(), Some("analyzer failed for 7"));
	}

	#[tokio::test]
	async fn aborted_task_has_no_panic_message() {
		let handle = spawn("test", tokio::time::sleep(Duration::from_secs(60)));
		handle.abort();
		let err = handle.await.unwrap_err();
		assert!(join_error_panic_message(err).is_none());
	}

	#[test]
	fn spawn_outside_runtime_uses_fallback() {
		let handle = spawn_blocking("test", || 40 + 2);
		let value = std::thread::spawn(move || block_on(handle)).join().unwrap();
		assert_eq!(value, 42);
	}

	fn block_on<T>(handle: JoinHandle<T>) -> T {
		let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
		rt.block_on(handle).unwrap()
	}
}
