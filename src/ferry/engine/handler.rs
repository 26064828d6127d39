use std::{sync::Arc, time::Duration};

use russh::{
    Channel,
    server::{Auth, Handler, Msg, Session},
};

use crate::ferry::{
    auth::AuthValidator,
    buffer::BufferPool,
    engine::{
        OnAuthenticated,
        forward::{self, ChannelOpenRequest},
    },
    relay::{self, CloseSignal, Ends},
};

const CHANNEL_ENDS: Ends = Ends {
    a: "channel",
    b: "target",
};

/// Per-connection SSH handler: password auth and `direct-tcpip` only.
pub(crate) struct TunnelHandler {
    pub(crate) sid: String,
    pub(crate) validator: Arc<dyn AuthValidator>,
    pub(crate) banner: String,
    pub(crate) on_authenticated: Option<OnAuthenticated>,
    pub(crate) user: Option<String>,
    pub(crate) pool: BufferPool,
    pub(crate) dial_timeout: Duration,
    pub(crate) close: CloseSignal,
}

impl Handler for TunnelHandler {
    type Error = russh::Error;

    async fn authentication_banner(&mut self) -> Result<Option<String>, Self::Error> {
        if self.banner.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.banner.clone()))
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let validator = self.validator.clone();
        let (u, p) = (user.to_string(), password.to_string());
        let ok = tokio::task::spawn_blocking(move || validator.validate(&u, &p))
            .await
            .unwrap_or(false);

        if ok {
            tracing::info!(sid=%self.sid, user=%user, "engine: password accepted");
            self.user = Some(user.to_string());
            Ok(Auth::Accept)
        } else {
            tracing::warn!(sid=%self.sid, user=%user, "engine: password rejected");
            Ok(Auth::reject())
        }
    }

    async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<(), Self::Error> {
        let user = self.user.clone().unwrap_or_default();
        if let Some(cb) = self.on_authenticated.take() {
            cb(&user);
        }
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::warn!(sid=%self.sid, "engine: session channel refused; only port forwarding allowed");
        Ok(false)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let req = match ChannelOpenRequest::from_parts(host_to_connect, port_to_connect) {
            Ok(req) => req,
            Err(err) => {
                tracing::warn!(sid=%self.sid, err=%err, "engine: channel refused");
                return Ok(false);
            }
        };

        tracing::debug!(
            sid=%self.sid,
            target=%req.target(),
            origin=%format!("{originator_address}:{originator_port}"),
            "engine: direct-tcpip"
        );

        let sid = self.sid.clone();
        let pool = self.pool.clone();
        let dial_timeout = self.dial_timeout;
        let session_close = self.close.clone();
        tokio::spawn(async move {
            let target = match forward::dial_target(&req, dial_timeout).await {
                Ok(t) => t,
                Err(err) => {
                    tracing::warn!(sid=%sid, target=%req.target(), err=%format!("{err:#}"), "engine: target unreachable");
                    let _ = channel.close().await;
                    return;
                }
            };

            // Linked only once there is a relay to tear down.
            let close = session_close.child();
            let stats = relay::relay(&pool, channel.into_stream(), target, close, &sid, CHANNEL_ENDS).await;
            tracing::debug!(
                sid=%sid,
                target=%req.target(),
                up=stats.forward,
                down=stats.backward,
                "engine: channel closed"
            );
        });

        Ok(true)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::warn!(sid=%self.sid, address=%address, port=*port, "engine: remote forwarding refused");
        Ok(false)
    }
}
