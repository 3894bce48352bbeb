use std::fs;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tern::{Config, Server, ServerHandle, TernResult};

struct Running {
    handle: ServerHandle,
    thread: Option<JoinHandle<TernResult<()>>>,
}

impl Running {
    fn addr(&self) -> SocketAddrV4 {
        self.handle.local_addr()
    }

    fn stop(mut self) -> TernResult<()> {
        self.handle.shutdown();
        self.thread
            .take()
            .unwrap()
            .join()
            .expect("server thread panicked")
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.shutdown();
            let _ = thread.join();
        }
    }
}

fn start(root: &Path) -> Running {
    let config = Config {
        host: Ipv4Addr::LOCALHOST,
        port: 0,
        thread_count: 4,
        linger: false,
        root: root.to_path_buf(),
        ..Config::default()
    };
    let server = Server::bind(&config).expect("Failed to bind server");
    let handle = server.handle();
    let thread = thread::spawn(move || server.run());
    Running {
        handle,
        thread: Some(thread),
    }
}

fn send(addr: SocketAddrV4, raw: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).expect("Failed to connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(raw).unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).expect("Server did not close the connection");
    String::from_utf8_lossy(&reply).into_owned()
}

fn get(addr: SocketAddrV4, path: &str) -> String {
    send(addr, format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).as_bytes())
}

fn header<'a>(reply: &'a str, name: &str) -> Option<&'a str> {
    let head = reply.split("\r\n\r\n").next()?;
    head.lines().skip(1).find_map(|line| {
        let (k, v) = line.split_once(": ")?;
        k.eq_ignore_ascii_case(name).then_some(v)
    })
}

fn body(reply: &str) -> &str {
    reply.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("")
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn site() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("hello.txt"), "hello world").unwrap();
    fs::create_dir(dir.path().join("docs")).unwrap();
    fs::write(dir.path().join("docs/guide.html"), "<p>guide</p>").unwrap();
    fs::create_dir(dir.path().join("docs/images")).unwrap();
    dir
}

#[test]
fn test_get_static_file() {
    let root = site();
    let server = start(root.path());

    let reply = get(server.addr(), "/hello.txt");
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{}", reply);
    assert_eq!(header(&reply, "Content-Length"), Some("11"));
    assert_eq!(header(&reply, "Connection"), Some("close"));
    assert_eq!(header(&reply, "Content-Type"), Some("text/plain; charset=UTF-8"));
    assert!(header(&reply, "Date").is_some());
    assert!(header(&reply, "Last-Modified").is_some());
    assert_eq!(body(&reply), "hello world");

    server.stop().unwrap();
}

#[test]
fn test_query_string_is_ignored() {
    let root = site();
    let server = start(root.path());
    let reply = get(server.addr(), "/hello.txt?v=2");
    assert_eq!(body(&reply), "hello world");
}

#[test]
fn test_missing_file_is_404() {
    let root = site();
    let server = start(root.path());
    let reply = get(server.addr(), "/nope.txt");
    assert!(reply.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", reply);
    assert!(body(&reply).contains("404 - Not Found"));
}

#[test]
fn test_traversal_is_403() {
    let root = site();
    let server = start(root.path());
    let reply = get(server.addr(), "/../../etc/passwd");
    assert!(reply.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{}", reply);
}

#[test]
fn test_directory_redirect_and_listing() {
    let root = site();
    let server = start(root.path());

    let reply = get(server.addr(), "/docs");
    assert!(reply.starts_with("HTTP/1.1 301 Moved Permanently\r\n"), "{}", reply);
    assert_eq!(header(&reply, "Location"), Some("/docs/"));

    let reply = get(server.addr(), "/docs/");
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{}", reply);
    let page = body(&reply);
    assert!(page.contains("Index of /docs/"));
    let dir_pos = page.find("images/").unwrap();
    let file_pos = page.find("guide.html").unwrap();
    assert!(dir_pos < file_pos, "directories must be listed before files");
}

#[test]
fn test_post_form() {
    let root = site();
    let server = start(root.path());

    let reply = send(
        server.addr(),
        b"POST /submit HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\nname=Jane+Doe&city=S%C3%A3o+Paulo",
    );
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{}", reply);
    assert_eq!(
        body(&reply),
        "Received POST data:\n    city = São Paulo\n    name = Jane Doe\n"
    );
}

#[test]
fn test_unknown_method_is_405() {
    let root = site();
    let server = start(root.path());

    let reply = send(server.addr(), b"DELETE /anything HTTP/1.1\r\n\r\n");
    assert!(reply.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"), "{}", reply);
    assert!(body(&reply).contains("Method DELETE is not allowed."));
    assert!(wait_until(|| server.handle.active_connections() == 0));
}

#[test]
fn test_file_updates_are_served() {
    let root = site();
    let server = start(root.path());
    let path = root.path().join("hello.txt");

    assert_eq!(body(&get(server.addr(), "/hello.txt")), "hello world");

    fs::write(&path, "changed").unwrap();
    let file = fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(std::time::SystemTime::UNIX_EPOCH + Duration::from_secs(42))
        .unwrap();
    assert_eq!(body(&get(server.addr(), "/hello.txt")), "changed");

    fs::remove_file(&path).unwrap();
    assert!(get(server.addr(), "/hello.txt").starts_with("HTTP/1.1 404"));
}

#[test]
fn test_many_concurrent_clients() {
    let root = site();
    let server = start(root.path());
    let addr = server.addr();

    let clients: Vec<_> = (0..64)
        .map(|_| thread::spawn(move || get(addr, "/hello.txt")))
        .collect();
    for client in clients {
        let reply = client.join().unwrap();
        assert_eq!(body(&reply), "hello world");
    }

    assert!(
        wait_until(|| server.handle.active_connections() == 0),
        "connections left registered"
    );
    server.stop().unwrap();
}

#[test]
fn test_client_hangup_is_cleaned_up() {
    let root = site();
    let server = start(root.path());

    let stream = TcpStream::connect(server.addr()).unwrap();
    assert!(wait_until(|| server.handle.active_connections() == 1));
    drop(stream);
    assert!(wait_until(|| server.handle.active_connections() == 0));
}

#[test]
fn test_shutdown_closes_idle_connections() {
    let root = site();
    let server = start(root.path());

    let mut idle = TcpStream::connect(server.addr()).unwrap();
    idle.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    assert!(wait_until(|| server.handle.active_connections() == 1));

    let handle = server.handle.clone();
    server.stop().unwrap();
    assert!(handle.is_shutdown());
    assert_eq!(handle.active_connections(), 0);

    let mut buf = [0u8; 16];
    assert_eq!(idle.read(&mut buf).unwrap(), 0);
}
