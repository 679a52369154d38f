#![forbid(unsafe_code)]

//! Canned-response HTTP server for client tests.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Clone)]
pub(crate) struct Route {
	pub method: &'static str,
	/// Matched as a prefix of the request target, query included.
	pub path: &'static str,
	pub status: u16,
	pub body: String,
	pub headers: Vec<(&'static str, String)>,
}

impl Route {
	pub fn new(method: &'static str, path: &'static str, status: u16, body: impl Into<String>) -> Self {
		Self {
			method,
			path,
			status,
			body: body.into(),
			headers: Vec::new(),
		}
	}

	pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
		self.headers.push((name, value.into()));
		self
	}
}

pub(crate) struct FakeHttp {
	pub base: String,
	requests: Arc<Mutex<Vec<(Instant, String)>>>,
	task: JoinHandle<()>,
}

impl FakeHttp {
	/// Every raw request received so far, head and body.
	pub fn requests(&self) -> Vec<String> {
		self.requests.lock().iter().map(|(_, r)| r.clone()).collect()
	}

	pub fn count(&self, path: &str) -> usize {
		self.arrivals(path).len()
	}

	/// When each request for `path` arrived, oldest first.
	pub fn arrivals(&self, path: &str) -> Vec<Instant> {
		self.requests
			.lock()
			.iter()
			.filter(|(_, r)| r.split_whitespace().nth(1).is_some_and(|p| p.starts_with(path)))
			.map(|(at, _)| *at)
			.collect()
	}
}

impl Drop for FakeHttp {
	fn drop(&mut self) {
		self.task.abort();
	}
}

pub(crate) async fn serve(routes: Vec<Route>) -> FakeHttp {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake http");
	let addr = listener.local_addr().expect("local addr");
	let requests = Arc::new(Mutex::new(Vec::new()));
	let routes = Arc::new(routes);

	let task = tokio::spawn({
		let requests = requests.clone();
		async move {
			while let Ok((mut sock, _)) = listener.accept().await {
				let routes = routes.clone();
				let requests = requests.clone();
				tokio::spawn(async move {
					let request = read_request(&mut sock).await;
					let arrived = Instant::now();
					let mut head = request.split_whitespace();
					let method = head.next().unwrap_or_default().to_string();
					let target = head.next().unwrap_or_default().to_string();
					requests.lock().push((arrived, request));

					let (status, body, extra) = routes
						.iter()
						.find(|r| r.method == method && target.starts_with(r.path))
						.map_or((404, String::new(), String::new()), |r| {
							let extra: String = r.headers.iter().map(|(k, v)| format!("{k}: {v}\r\n")).collect();
							(r.status, r.body.clone(), extra)
						});
					let resp = format!(
						"HTTP/1.1 {status} Test\r\ncontent-type: application/json\r\ncontent-length: {}\r\n{extra}connection: close\r\n\r\n{body}",
						body.len()
					);
					let _ = sock.write_all(resp.as_bytes()).await;
					let _ = sock.shutdown().await;
				});
			}
		}
	});

	FakeHttp {
		base: format!("http://{addr}"),
		requests,
		task,
	}
}

async fn read_request(sock: &mut TcpStream) -> String {
	let mut buf = Vec::new();
	let mut chunk = [0u8; 4096];
	loop {
		let Ok(n) = sock.read(&mut chunk).await else {
			break;
		};
		if n == 0 {
			break;
		}
		buf.extend_from_slice(&chunk[..n]);
		if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
			let head = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
			let len = head
				.lines()
				.find_map(|l| l.strip_prefix("content-length:"))
				.and_then(|v| v.trim().parse::<usize>().ok())
				.unwrap_or(0);
			if buf.len() >= pos + 4 + len {
				break;
			}
		}
	}
	String::from_utf8_lossy(&buf).into_owned()
}
