use std::ffi::{CStr, CString};
use std::fs::{metadata, File};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{dup2, execv, fork, ForkResult};

const DEFAULT_INDEX_NAME: &str = "home.html";
const DEFAULT_MIME_TYPE: &str = "text/plain";
const CGI_NAMESPACE: &str = "cgi-bin";
const SERVER_HEADER: &str = concat!(
    "Server: ",
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    "\r\n"
);

fn main() -> Result<()> {
    let server = Server::from_command_line()?;
    let listener = server.create_listener()?;

    // A client hanging up mid-reply must surface as EPIPE, not kill us.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;

    // One connection at a time: accept, serve one request, close, repeat.
    loop {
        let (stream, addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                eprintln!("warning: accept() failed: {}", e);
                continue;
            }
        };
        if let Err(e) = handle_connection(&stream, addr) {
            eprintln!("warning: failed serving {}: {}", addr, e);
        }
    }
}

/// Runtime configuration parsed from the command line.
#[derive(Debug)]
struct Server {
    bindport: u16,
}
impl Server {
    fn from_command_line() -> Result<Self> {
        let mut args = std::env::args();
        let name = args.next().expect("expected at least one argument");
        let port = match (args.next(), args.next()) {
            (Some(port), None) => port,
            _ => {
                eprintln!("usage: {} <port>", name);
                std::process::exit(1);
            }
        };
        let bindport = port
            .parse()
            .with_context(|| format!("port number {} is invalid", port))?;
        Ok(Self { bindport })
    }
    /// Initialize the TcpListener. This is the socket that we accept connections from.
    fn create_listener(&self) -> Result<TcpListener> {
        let socket_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.bindport));
        let listener = TcpListener::bind(socket_addr)
            .with_context(|| format!("failed to create listening socket for {}", socket_addr))?;
        println!("listening on: http://{}/", socket_addr);
        Ok(listener)
    }
}

/// First line of a request, split into its whitespace-separated parts.
#[derive(Debug)]
struct Request {
    method: String,
    uri: String,
    version: String,
}
impl Request {
    /// Parse a request line like `GET /index.html HTTP/1.0`. Missing parts
    /// come back empty and fall out at the method check.
    fn parse(line: &str) -> Self {
        let mut parts = line.split_whitespace();
        let method = parts.next().unwrap_or("").to_string();
        let uri = parts.next().unwrap_or("").to_string();
        let version = parts.next().unwrap_or("").to_string();
        Self {
            method,
            uri,
            version,
        }
    }
}

/// Serve one request off a freshly accepted connection.
///
/// Everything the client can be told about goes through `client_error`;
/// transport failures propagate and just close the connection.
fn handle_connection(stream: &TcpStream, addr: SocketAddr) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut conn = stream;

    let mut request_line = String::new();
    if reader.read_line(&mut request_line)? == 0 {
        return Ok(()); // client hung up without sending a request
    }
    let request = Request::parse(&request_line);
    log_request(addr, &request);

    if !request.method.eq_ignore_ascii_case("GET") && !request.method.eq_ignore_ascii_case("HEAD")
    {
        client_error(
            &mut conn,
            &request.method,
            501,
            "Not implemented",
            "Server does not implement this method",
        )?;
        return Ok(());
    }

    read_request_headers(&mut reader)?;

    let route = parse_uri(&request.uri);
    let stat = match metadata(route.filename()) {
        Ok(stat) => stat,
        Err(_) => {
            client_error(
                &mut conn,
                route.filename(),
                404,
                "Not found",
                "Server couldn't find this file",
            )?;
            return Ok(());
        }
    };

    // HEAD gets the headers the matching GET would get, and nothing else.
    if request.method.eq_ignore_ascii_case("HEAD") {
        write_response_header(&mut conn, route.filename(), stat.len())?;
        return Ok(());
    }

    match route {
        Route::Static { ref filename } => {
            if !stat.is_file() || stat.mode() & libc::S_IRUSR == 0 {
                client_error(
                    &mut conn,
                    filename,
                    403,
                    "Forbidden",
                    "Server couldn't read the file",
                )?;
                return Ok(());
            }
            serve_static(&mut conn, filename, stat.len())?;
        }
        Route::Cgi {
            ref filename,
            ref query,
        } => {
            if !stat.is_file() || stat.mode() & libc::S_IXUSR == 0 {
                client_error(
                    &mut conn,
                    filename,
                    403,
                    "Forbidden",
                    "Server couldn't run the CGI program",
                )?;
                return Ok(());
            }
            serve_dynamic(stream, filename, query)?;
        }
    }
    Ok(())
}

/// Read and discard header lines up to the terminating blank line. No
/// header is interpreted.
fn read_request_headers<R: BufRead>(reader: &mut R) -> io::Result<()> {
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 || line == "\r\n" || line == "\n" {
            return Ok(());
        }
    }
}

/// Where a request URI points: a file served verbatim, or a CGI program.
#[derive(Debug, PartialEq)]
enum Route {
    Static { filename: String },
    Cgi { filename: String, query: String },
}
impl Route {
    fn filename(&self) -> &str {
        match self {
            Route::Static { filename } => filename,
            Route::Cgi { filename, .. } => filename,
        }
    }
}

/// Map a URI onto the filesystem, relative to the working directory.
///
/// URIs naming the CGI namespace are split at the first `?` into program
/// path and query string. No percent-decoding and no `..` normalization:
/// the path is used exactly as the client sent it.
fn parse_uri(uri: &str) -> Route {
    if !uri.contains(CGI_NAMESPACE) {
        let mut filename = format!(".{}", uri);
        if uri.ends_with('/') {
            filename.push_str(DEFAULT_INDEX_NAME);
        }
        Route::Static { filename }
    } else {
        let (path, query) = match uri.find('?') {
            Some(mark) => (&uri[..mark], &uri[mark + 1..]),
            None => (uri, ""),
        };
        Route::Cgi {
            filename: format!(".{}", path),
            query: query.to_string(),
        }
    }
}

// Checked in order; a fragment match anywhere in the name wins.
const MIME_TABLE: &[(&str, &str)] = &[
    (".html", "text/html"),
    (".gif", "image/gif"),
    (".png", "image/png"),
    (".jpg", "image/jpeg"),
    (".mp4", "video/mp4"),
];

/// MIME type for a filename. Matching is substring-based rather than
/// suffix-based, so `a.html.bak` is still served as text/html.
fn content_type(filename: &str) -> &'static str {
    MIME_TABLE
        .iter()
        .find(|(fragment, _)| filename.contains(fragment))
        .map(|&(_, mimetype)| mimetype)
        .unwrap_or(DEFAULT_MIME_TYPE)
}

/// Send a complete error response: status line, headers, and a small HTML
/// body naming what went wrong.
fn client_error<W: Write>(
    conn: &mut W,
    cause: &str,
    code: u16,
    shortmsg: &str,
    longmsg: &str,
) -> io::Result<()> {
    write!(
        conn,
        "HTTP/1.1 {} {}\r\n\
        Content-type: text/html\r\n\
        \r\n",
        code, shortmsg
    )?;
    write!(
        conn,
        "<html><head><title>{} {}</title></head><body>\r\n\
        {}: {}\r\n\
        <p>{}: {}\r\n\
        <hr><em>{}</em>\r\n\
        </body></html>\r\n",
        code,
        shortmsg,
        code,
        shortmsg,
        longmsg,
        cause,
        env!("CARGO_PKG_NAME"),
    )
}

/// Write the success header block for a file of known size.
fn write_response_header<W: Write>(conn: &mut W, filename: &str, filesize: u64) -> io::Result<()> {
    write!(
        conn,
        "HTTP/1.0 200 OK\r\n\
        {}\
        Connection: close\r\n\
        Content-length: {}\r\n\
        Content-type: {}\r\n\
        \r\n",
        SERVER_HEADER,
        filesize,
        content_type(filename)
    )
}

/// Send a file verbatim. The caller has already checked that the path is a
/// readable regular file. The transfer is bounded to the byte count
/// captured at stat time, which is what Content-length promised.
fn serve_static<W: Write>(conn: &mut W, filename: &str, filesize: u64) -> io::Result<()> {
    write_response_header(conn, filename, filesize)?;
    let file = File::open(filename)?;
    io::copy(&mut file.take(filesize), conn)?;
    Ok(())
}

/// Run a CGI program with its stdout pointed at the client.
///
/// Only the status line and Server header are written here; the program
/// produces the rest of its own headers and the blank line. The query
/// string travels in QUERY_STRING, and the parent blocks until the child
/// exits, so one CGI program runs at a time.
fn serve_dynamic(conn: &TcpStream, filename: &str, query: &str) -> Result<()> {
    let mut writer = conn;
    write!(writer, "HTTP/1.0 200 OK\r\n{}", SERVER_HEADER)?;

    let program = CString::new(filename)?;
    match unsafe { fork() }.context("failed to fork CGI process")? {
        ForkResult::Child => {
            std::env::set_var("QUERY_STRING", query);
            if dup2(conn.as_raw_fd(), libc::STDOUT_FILENO).is_err() {
                std::process::exit(127);
            }
            let _ = execv(&program, &[] as &[&CStr]);
            // exec failed: die without unwinding into the parent's state
            std::process::exit(127);
        }
        ForkResult::Parent { child } => {
            waitpid(child, None).context("failed to wait for CGI process")?;
            Ok(())
        }
    }
}

/// Common Log Format (CLF) formatted date in local timezone.
struct ClfDate(SystemTime);

impl std::fmt::Display for ClfDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = DateTime::<Local>::from(self.0);
        write!(f, "{}", datetime.format("[%d/%b/%Y:%H:%M:%S %z]"))
    }
}

/// Add the request line to the access log on stdout.
fn log_request(addr: SocketAddr, request: &Request) {
    println!(
        "{} - - {} \"{} {} {}\"",
        addr.ip(),
        ClfDate(SystemTime::now()),
        request.method,
        request.uri,
        request.version,
    );
}
