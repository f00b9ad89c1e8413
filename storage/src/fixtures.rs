use std::io::Write;
use std::path::Path;

use async_compression::tokio::write::GzipEncoder;
use tokio::io::AsyncWriteExt;

/// Writes a ZIP archive with the given `(name, contents)` members.
pub fn write_zip(path: &Path, entries: &[(&str, &str)]) {
    let mut zip = zip::ZipWriter::new(std::fs::File::create(path).unwrap());
    let options = zip::write::SimpleFileOptions::default();
    for (name, contents) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(contents.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}

async fn tar_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tokio_tar::Builder::new(Vec::new());
    for (name, contents) in entries {
        let mut header = tokio_tar::Header::new_gnu();
        header.set_entry_type(tokio_tar::EntryType::Regular);
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, name, contents.as_bytes())
            .await
            .unwrap();
    }
    builder.into_inner().await.unwrap()
}

/// Writes an uncompressed tarball with the given `(name, contents)` members.
pub async fn write_tar(path: &Path, entries: &[(&str, &str)]) {
    tokio::fs::write(path, tar_bytes(entries).await)
        .await
        .unwrap();
}

/// Writes a gzip-compressed tarball with the given `(name, contents)` members.
pub async fn write_tar_gz(path: &Path, entries: &[(&str, &str)]) {
    let mut encoder = GzipEncoder::new(Vec::new());
    encoder.write_all(&tar_bytes(entries).await).await.unwrap();
    encoder.shutdown().await.unwrap();
    tokio::fs::write(path, encoder.into_inner()).await.unwrap();
}

/// Serves `(path, body)` pairs over plain HTTP on a local port until the
/// runtime shuts down, answering 404 for anything else. Returns the base url.
pub async fn serve_http(files: &[(&str, &str)]) -> String {
    serve_http_requiring(files, None).await
}

/// Like [serve_http], but answers 401 to requests missing the given header
/// line (compared case-insensitively, e.g. `x-auth-token: secret`).
pub async fn serve_http_requiring(files: &[(&str, &str)], header: Option<&str>) -> String {
    use tokio::io::AsyncReadExt;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let files: std::collections::HashMap<String, String> = files
        .iter()
        .map(|(path, body)| (path.to_string(), body.to_string()))
        .collect();
    let header = header.map(str::to_lowercase);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let files = files.clone();
            let header = header.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut chunk = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&chunk[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&request);
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();

                let authorized = header
                    .as_ref()
                    .map_or(true, |h| request.to_lowercase().contains(h.as_str()));
                let response = match files.get(&path) {
                    _ if !authorized => {
                        "HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                            .to_string()
                    }
                    Some(body) => format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    ),
                    None => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        .to_string(),
                };
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{}", addr)
}

/// Serves `(path, body)` pairs over a minimal passive-mode FTP server,
/// accepting any login. Returns the base url.
///
/// Unknown files and directories without files in them are answered with
/// `550`.
pub async fn serve_ftp(files: &[(&str, &str)]) -> String {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let files: std::collections::HashMap<String, String> = files
        .iter()
        .map(|(path, body)| (path.to_string(), body.to_string()))
        .collect();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let files = files.clone();
            tokio::spawn(async move {
                let (read, mut write) = socket.into_split();
                let mut lines = BufReader::new(read).lines();
                let mut data: Option<tokio::net::TcpListener> = None;
                write.write_all(b"220 ready\r\n").await.unwrap();

                while let Ok(Some(line)) = lines.next_line().await {
                    let (command, arg) = line.split_once(' ').unwrap_or((line.as_str(), ""));
                    let payload = match command.to_uppercase().as_str() {
                        "RETR" => files.get(arg).cloned(),
                        "NLST" => {
                            let dir = format!("{}/", arg.trim_end_matches('/'));
                            let names: Vec<&str> = files
                                .keys()
                                .filter_map(|path| path.strip_prefix(dir.as_str()))
                                .filter(|name| !name.contains('/'))
                                .collect();
                            (!names.is_empty()).then(|| names.join("\r\n") + "\r\n")
                        }
                        _ => None,
                    };

                    let reply = match command.to_uppercase().as_str() {
                        "USER" => "331 password please".to_string(),
                        "PASS" => "230 logged in".to_string(),
                        "TYPE" => "200 ok".to_string(),
                        "PASV" => {
                            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                            let port = listener.local_addr().unwrap().port();
                            data = Some(listener);
                            format!("227 Entering Passive Mode (127,0,0,1,{},{})", port / 256, port % 256)
                        }
                        "RETR" | "NLST" => match data.take() {
                            Some(listener) => {
                                let (mut conn, _) = listener.accept().await.unwrap();
                                match payload {
                                    Some(payload) => {
                                        write.write_all(b"150 sending\r\n").await.unwrap();
                                        conn.write_all(payload.as_bytes()).await.unwrap();
                                        conn.shutdown().await.unwrap();
                                        drop(conn);
                                        "226 done".to_string()
                                    }
                                    None => "550 no such file or directory".to_string(),
                                }
                            }
                            None => "425 use PASV first".to_string(),
                        },
                        "QUIT" => {
                            let _ = write.write_all(b"221 bye\r\n").await;
                            return;
                        }
                        _ => "502 not implemented".to_string(),
                    };
                    if write.write_all(format!("{}\r\n", reply).as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    format!("ftp://{}", addr)
}

/// Serves a keystone v3 token endpoint whose catalog holds a single public
/// object store at `storage_url`. Every login issues a new token
/// (`token-1`, `token-2`, ...) expiring at `expires_at`.
///
/// Returns the identity url along with the number of logins so far.
pub async fn serve_keystone(
    storage_url: &str,
    expires_at: chrono::DateTime<chrono::Utc>,
) -> (String, std::sync::Arc<std::sync::atomic::AtomicUsize>) {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let logins = Arc::new(AtomicUsize::new(0));
    let body = serde_json::json!({
        "token": {
            "expires_at": expires_at.to_rfc3339(),
            "catalog": [{
                "type": "object-store",
                "endpoints": [{ "interface": "public", "region": "RegionOne", "url": storage_url }]
            }]
        }
    })
    .to_string();

    let counter = logins.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let (logins, body) = (counter.clone(), body.clone());
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut chunk = [0u8; 1024];
                let head_len = loop {
                    if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&chunk[..n]),
                    }
                };
                let head = String::from_utf8_lossy(&request[..head_len]).to_lowercase();
                let content_length: usize = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(0);
                while request.len() < head_len + content_length {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&chunk[..n]),
                    }
                }

                let response = if head.starts_with("post /v3/auth/tokens ") {
                    let n = logins.fetch_add(1, Ordering::SeqCst) + 1;
                    format!(
                        "HTTP/1.1 201 Created\r\nX-Subject-Token: token-{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        n,
                        body.len(),
                        body
                    )
                } else {
                    "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        .to_string()
                };
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (format!("http://{}", addr), logins)
}
