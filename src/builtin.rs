//! Built-in service method names (spec §4.5, §11), shared by both the
//! heartbeat caller in `channel` and the streaming caller/handler in
//! `stream`. Grounded in `examples/original_source/poppy/rpc_builtin_service.h`
//! and `streaming/streaming_service.h`.

/// Payload a healthy `Health` RPC must return; anything else is treated as
/// a failed heartbeat exactly like a transport failure (spec §11).
pub(crate) const HEALTH_OK_PAYLOAD: &[u8] = b"OK";

pub(crate) const HEALTH_SERVICE: &str = "poppy.BuiltinService";
pub(crate) const HEALTH_METHOD: &str = "poppy.BuiltinService.Health";

/// Register the built-in `poppy.BuiltinService.Health` method every server
/// answers regardless of which user services it registers — the channel's
/// heartbeat (`crate::channel::connection::heartbeat`) depends on every peer
/// understanding this call to ever reach `Healthy` (spec §4.1 "Heartbeat").
#[cfg(feature = "server")]
pub(crate) fn register_health(server: &crate::server::Server) {
    use bytes::Bytes;

    let table = crate::service::MethodTable::<()>::new(HEALTH_SERVICE)
        .method("Health", |_state, _req| async move { Ok(Bytes::from_static(HEALTH_OK_PAYLOAD)) });
    server.register(crate::server::ServiceEntry::from_table((), table));
}

pub(crate) mod streaming_method {
    pub(crate) const CREATE_INPUT_STREAM: &str = "poppy.StreamingService.CreateInputStream";
    pub(crate) const CREATE_OUTPUT_STREAM: &str = "poppy.StreamingService.CreateOutputStream";
    pub(crate) const CLOSE_INPUT_STREAM: &str = "poppy.StreamingService.CloseInputStream";
    pub(crate) const CLOSE_OUTPUT_STREAM: &str = "poppy.StreamingService.CloseOutputStream";
    pub(crate) const UPLOAD_PACKET: &str = "poppy.StreamingService.UploadPacket";
    pub(crate) const DOWNLOAD_PACKET: &str = "poppy.StreamingService.DownloadPacket";
}
