//! A bare-bones HTTP server for exercising the network clients.
use std::{
    io::{BufRead, BufReader, Write},
    net::TcpListener,
    sync::mpsc::{self, Receiver},
    time::Duration,
};

/// Serve `responses` in order, one per connection. Each response is written verbatim and its
/// connection closed after `hold_open`.
///
/// Returns the server's base url and a receiver of each connection's request line.
pub(crate) fn serve(responses: Vec<&'static str>, hold_open: Duration) -> (String, Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    let (requests, received) = mpsc::channel();
    std::thread::spawn(move || {
        for response in responses {
            let (mut socket, _) = listener.accept().unwrap();
            let requests = requests.clone();
            std::thread::spawn(move || {
                let mut reader = BufReader::new(socket.try_clone().unwrap());
                let mut request_line = String::new();
                reader.read_line(&mut request_line).unwrap();
                // Consume the rest of the request head.
                let mut line = String::new();
                while reader.read_line(&mut line).unwrap() > 0 && line != "\r\n" {
                    line.clear();
                }
                let _ = requests.send(request_line.trim_end().to_owned());
                socket.write_all(response.as_bytes()).unwrap();
                std::thread::sleep(hold_open);
            });
        }
    });
    (format!("http://{address}"), received)
}

pub(crate) fn serve_once(response: &'static str, hold_open: Duration) -> String {
    serve(vec![response], hold_open).0
}
