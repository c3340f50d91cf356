use super::*;

pub fn serve_http_with_workers(
    collector: Arc<Collector>,
    bind_addr: &str,
    worker_count: usize,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr)?;
    serve_listener(collector, listener, worker_count)
}

/// Accepts connections on `listener` until it fails for good. Connections
/// are handed to `worker_count` workers through a bounded queue; when the
/// queue is full the connection is answered with 503 right away.
pub fn serve_listener(
    collector: Arc<Collector>,
    listener: TcpListener,
    worker_count: usize,
) -> std::io::Result<()> {
    let worker_count = worker_count.max(1);
    let queue_capacity = resolve_http_queue_capacity(worker_count);
    let (tx, rx) = mpsc::sync_channel::<TcpStream>(queue_capacity);
    let rx = Arc::new(Mutex::new(rx));

    std::thread::scope(|scope| {
        for _ in 0..worker_count {
            let collector = Arc::clone(&collector);
            let rx = Arc::clone(&rx);
            scope.spawn(move || {
                loop {
                    let stream = {
                        let guard = match rx.lock() {
                            Ok(guard) => guard,
                            Err(_) => break,
                        };
                        match guard.recv() {
                            Ok(stream) => stream,
                            Err(_) => break,
                        }
                    };
                    if let Err(err) = handle_connection(&collector, stream) {
                        tracing::warn!(error = %err, "collector transport connection error");
                    }
                }
            });
        }

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => match tx.try_send(stream) {
                    Ok(()) => {}
                    Err(mpsc::TrySendError::Full(stream)) => {
                        tracing::warn!(queue_capacity, "collector worker queue full");
                        if let Err(err) =
                            write_backpressure_response(&collector, stream, SOCKET_TIMEOUT_SECS)
                        {
                            tracing::warn!(
                                error = %err,
                                "collector transport backpressure response failed"
                            );
                        }
                    }
                    Err(mpsc::TrySendError::Disconnected(_)) => {
                        tracing::error!("collector transport worker queue closed");
                        break;
                    }
                },
                Err(err) => tracing::warn!(error = %err, "collector transport accept error"),
            }
        }
        drop(tx);
    });

    Ok(())
}

fn handle_connection(collector: &Collector, mut stream: TcpStream) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(SOCKET_TIMEOUT_SECS)))?;
    stream.set_write_timeout(Some(Duration::from_secs(SOCKET_TIMEOUT_SECS)))?;

    let request = match read_http_request(&mut stream) {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(rejection) => {
            rejection.record(collector);
            return write_response(&mut stream, &rejection.response());
        }
    };

    let response = handle_request(collector, &request);
    write_response(&mut stream, &response)
}
