//! One-shot HTTP responder for exercising the reqwest clients.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Accept one connection, answer with `status` and `body`, and hand back the raw request.
pub async fn serve_once(status: u16, body: &str) -> (String, JoinHandle<String>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let url = format!("http://{}", listener.local_addr().unwrap());
  let body = body.to_string();

  let handle = tokio::spawn(async move {
    let (mut socket, _) = listener.accept().await.unwrap();
    let raw = read_request(&mut socket).await;

    let response = format!(
      "HTTP/1.1 {} Status\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
      status,
      body.len(),
      body
    );
    socket.write_all(response.as_bytes()).await.unwrap();
    let _ = socket.shutdown().await;
    raw
  });

  (url, handle)
}

async fn read_request(socket: &mut TcpStream) -> String {
  let mut buf = Vec::new();
  let mut chunk = [0u8; 1024];

  loop {
    let n = socket.read(&mut chunk).await.unwrap();
    if n == 0 {
      break;
    }
    buf.extend_from_slice(&chunk[..n]);

    if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
      let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
      let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
      if buf.len() >= end + 4 + content_length {
        break;
      }
    }
  }

  String::from_utf8_lossy(&buf).to_string()
}
