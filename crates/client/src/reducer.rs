//! The client connection reducer (C8): a pure
//! `(state, event) -> (state, commands)` function. No I/O, no clock, no
//! randomness — every time-dependent transition takes `now_ms` on the event.

use crate::{
    backoff::{SESSION_SKEW_MS, classify_handshake_rejection, human_message, local_backoff},
    command::Command,
    event::{ChannelOpenErrorKind, Event, ExchangeErrorKind},
    state::{CachedSession, ClientConnState, ConnectOrigin, Pending, ReducerState},
};

/// Applies one event, returning the next state and the commands the runtime
/// must execute, in order.
#[must_use]
pub fn reduce(state: &ReducerState, event: Event) -> (ReducerState, Vec<Command>) {
    let mut next = state.clone();
    let mut commands = Vec::new();

    match event {
        Event::AuthRefresh => {
            if next.auth_suppressed_by_user {
                next.public = ClientConnState::SignedOutDisconnected;
                next.pending = None;
                commands.push(Command::ChannelClose {
                    code: 1000,
                    reason: "auth_refresh_suppressed".into(),
                });
            } else {
                next.pending = Some(Pending::Auth { interactive: false });
                commands.push(Command::GetIdentity { interactive: false, clear_pref: false });
            }
        },

        Event::UiSignIn => {
            let clear_pref = next.clear_session_preference_on_next_sign_in;
            next.clear_session_preference_on_next_sign_in = false;
            next.auth_suppressed_by_user = false;
            next.pending = Some(Pending::Auth { interactive: true });
            commands.push(Command::GetIdentity { interactive: true, clear_pref });
        },

        Event::UiSignOut => {
            next.public = ClientConnState::SignedOutDisconnected;
            next.account_id = None;
            next.cached_session = None;
            next.pending = None;
            next.reconnect_scheduled = false;
            next.auth_suppressed_by_user = true;
            commands.push(Command::ReconnectCancel);
            commands.push(Command::ChannelClose { code: 1000, reason: "client_disconnect".into() });
        },

        Event::UiConnect { origin, endpoint, interactive } => {
            if !interactive && next.auth_suppressed_by_user {
                // no-op: a silent reconnect must not resurrect a user-suppressed session.
            } else {
                commands.push(Command::ReconnectCancel);
                next.reconnect_scheduled = false;
                next.pending =
                    Some(Pending::ConnectSession { origin, endpoint: endpoint.clone(), interactive });
                if interactive && !next.public.is_connecting() {
                    next.public = next.public.to_connecting(endpoint);
                }
                commands.push(Command::GetIdentity { interactive, clear_pref: false });
            }
        },

        Event::UiDisconnect => {
            next.public = next.public.to_disconnected();
            next.pending = None;
            commands.push(Command::ReconnectCancel);
            commands.push(Command::ChannelClose { code: 1000, reason: "client_disconnect".into() });
        },

        Event::IdentityResult { ok, session, error, now_ms } => match next.pending.clone() {
            Some(Pending::Auth { interactive }) => {
                next.pending = None;
                if !ok {
                    next.public = ClientConnState::SignedOutDisconnected;
                    if interactive {
                        commands.push(Command::Raise {
                            message: error.unwrap_or_else(|| "sign-in failed".to_string()),
                            code: None,
                        });
                    }
                } else if let Some(session) = session {
                    let changed = next
                        .account_id
                        .as_deref()
                        .is_some_and(|prev| prev != session.account_id);
                    if changed {
                        next.cached_session = None;
                        if next.public.is_connected() {
                            commands.push(Command::ChannelClose {
                                code: 1000,
                                reason: "account_changed".into(),
                            });
                        }
                    }
                    next.account_id = Some(session.account_id.clone());
                    next.public = ClientConnState::SignedInDisconnected { account_id: session.account_id };
                }
            },
            Some(Pending::ConnectSession { origin, endpoint, interactive: _ }) => {
                if !ok {
                    next.pending = None;
                    next.reconnect_scheduled = false;
                    commands.push(Command::ReconnectCancel);
                    commands.push(Command::ChannelClose { code: 1000, reason: "identity_failed".into() });
                    if origin == ConnectOrigin::User {
                        commands.push(Command::Raise {
                            message: error.unwrap_or_else(|| "sign-in failed".to_string()),
                            code: None,
                        });
                    }
                } else if let Some(session) = session {
                    let changed = next
                        .account_id
                        .as_deref()
                        .is_some_and(|prev| prev != session.account_id);
                    if changed {
                        next.cached_session = None;
                    }
                    next.account_id = Some(session.account_id.clone());

                    let reusable = next.cached_session.clone().filter(|cached| {
                        cached.account_id == session.account_id
                            && cached.expires_at_ms.saturating_sub(SESSION_SKEW_MS) > now_ms
                    });

                    if let Some(cached) = reusable {
                        next.pending = Some(Pending::ConnectChannel {
                            origin,
                            endpoint: endpoint.clone(),
                            token: cached.token.clone(),
                            access_token: session.access_token,
                            used_cached_session: true,
                            recovered: false,
                        });
                        next.public = next.public.to_connecting(endpoint.clone());
                        commands.push(Command::ChannelOpen { endpoint, token: cached.token });
                    } else {
                        next.pending = Some(Pending::ConnectExchange {
                            origin,
                            endpoint: endpoint.clone(),
                            access_token: session.access_token.clone(),
                            recovered: false,
                        });
                        commands.push(Command::Exchange { endpoint, access_token: session.access_token });
                    }
                }
            },
            _ => {},
        },

        Event::ExchangeResult { ok, session, error } => {
            if let Some(Pending::ConnectExchange { origin, endpoint, access_token, recovered }) =
                next.pending.clone()
            {
                if ok {
                    let Some(session) = session else { return (next, commands) };
                    let cached = CachedSession {
                        account_id: session.user.account_id.as_str().to_string(),
                        token: session.token,
                        expires_at_ms: session.expires_at_ms,
                        user: session.user,
                    };
                    next.account_id = Some(cached.account_id.clone());
                    next.pending = Some(Pending::ConnectChannel {
                        origin,
                        endpoint: endpoint.clone(),
                        token: cached.token.clone(),
                        access_token,
                        used_cached_session: false,
                        recovered,
                    });
                    next.public = next.public.to_connecting(endpoint.clone());
                    commands.push(Command::ChannelOpen { endpoint, token: cached.token.clone() });
                    commands.push(Command::Telemetry {
                        event: "auth.exchange.success",
                        fields: serde_json::json!({ "recovered": recovered }),
                    });
                    next.cached_session = Some(cached);
                } else {
                    next.pending = None;
                    match error {
                        Some(ExchangeErrorKind::Http { status: status @ (401 | 403) }) => {
                            next.cached_session = None;
                            next.account_id = None;
                            next.public = ClientConnState::SignedOutDisconnected;
                            commands.push(Command::Telemetry {
                                event: "auth.exchange.unauthorized",
                                fields: serde_json::json!({ "status": status }),
                            });
                        },
                        other => {
                            next.public = next.public.to_disconnected();
                            commands.push(Command::Telemetry {
                                event: "auth.exchange.failed",
                                fields: serde_json::json!({ "error": format!("{other:?}") }),
                            });
                            if origin == ConnectOrigin::User {
                                commands.push(Command::Raise {
                                    message: "could not sign in: the exchange request failed".into(),
                                    code: None,
                                });
                            }
                        },
                    }
                }
            }
        },

        Event::ChannelOpenResult { ok, error } => {
            if let Some(Pending::ConnectChannel {
                origin,
                endpoint,
                token: _,
                access_token,
                used_cached_session,
                recovered,
            }) = next.pending.clone()
            {
                if ok {
                    next.pending = None;
                    next.reconnect_attempt = 0;
                    let account_id = next.account_id.clone().unwrap_or_default();
                    next.public = match next.cached_session.clone() {
                        Some(cached) => {
                            ClientConnState::SignedInConnected { account_id, endpoint, user: cached.user }
                        },
                        None => ClientConnState::SignedInConnecting { account_id, endpoint },
                    };
                    commands.push(Command::Telemetry {
                        event: "ws.connect.success",
                        fields: serde_json::json!({
                            "usedCachedSession": used_cached_session,
                            "recovered": recovered,
                        }),
                    });
                } else {
                    match error {
                        Some(ChannelOpenErrorKind::HandshakeHttp { status: 401, .. })
                            if used_cached_session && !recovered =>
                        {
                            next.cached_session = None;
                            next.pending = Some(Pending::ConnectExchange {
                                origin,
                                endpoint: endpoint.clone(),
                                access_token: access_token.clone(),
                                recovered: true,
                            });
                            commands.push(Command::Exchange { endpoint, access_token });
                        },
                        Some(ChannelOpenErrorKind::HandshakeHttp {
                            status: 429,
                            retry_after_ms,
                            body_code,
                            body_text,
                        }) => {
                            let class = classify_handshake_rejection(
                                body_code.as_deref(),
                                body_text.as_deref(),
                                retry_after_ms,
                            );
                            use crate::backoff::HandshakeRejectionClass as C;
                            match (origin, class) {
                                (ConnectOrigin::Reconnect, C::RateLimited) => {
                                    let attempt = next.reconnect_attempt;
                                    let delay = local_backoff(attempt).max(retry_after_ms.unwrap_or(0));
                                    next.pending = None;
                                    next.reconnect_scheduled = true;
                                    next.reconnect_attempt += 1;
                                    next.public = next.public.to_disconnected();
                                    commands.push(Command::Telemetry {
                                        event: "handshake_http_error",
                                        fields: serde_json::json!({
                                            "status": 429,
                                            "classification": "rate_limited",
                                        }),
                                    });
                                    commands.push(Command::ReconnectSchedule { delay_ms: delay });
                                    commands.push(Command::Telemetry {
                                        event: "reconnect_scheduled",
                                        fields: serde_json::json!({ "attempt": attempt, "delayMs": delay }),
                                    });
                                },
                                (ConnectOrigin::Reconnect, _) => {
                                    next.pending = None;
                                    next.reconnect_scheduled = true;
                                    next.public = next.public.to_disconnected();
                                },
                                (ConnectOrigin::User, class) => {
                                    next.pending = None;
                                    next.public = next.public.to_disconnected();
                                    commands.push(Command::Raise {
                                        message: human_message(class, retry_after_ms),
                                        code: None,
                                    });
                                },
                            }
                        },
                        _ => {
                            next.pending = None;
                            next.public = next.public.to_disconnected();
                            commands.push(Command::Telemetry {
                                event: "ws.connect.error",
                                fields: serde_json::json!({}),
                            });
                            if origin == ConnectOrigin::User {
                                commands.push(Command::Raise {
                                    message: "could not connect to the chat server".into(),
                                    code: None,
                                });
                            }
                        },
                    }
                }
            }
        },

        Event::ChannelClosed { auto_reconnect_enabled } => {
            next.public = next.public.to_disconnected();
            if next.public.account_id().is_some() && auto_reconnect_enabled && !next.reconnect_scheduled {
                let attempt = next.reconnect_attempt;
                let delay = local_backoff(attempt);
                next.reconnect_scheduled = true;
                next.reconnect_attempt += 1;
                commands.push(Command::ReconnectSchedule { delay_ms: delay });
                commands.push(Command::Telemetry {
                    event: "reconnect_scheduled",
                    fields: serde_json::json!({ "attempt": attempt, "delayMs": delay }),
                });
            }
        },

        Event::TimerReconnectFired { endpoint } => {
            next.reconnect_scheduled = false;
            let (restate, mut recommands) = reduce(
                &next,
                Event::UiConnect { origin: ConnectOrigin::Reconnect, endpoint, interactive: false },
            );
            next = restate;
            commands.append(&mut recommands);
        },

        Event::ChannelWelcome { user } => {
            if let Some(cached) = next.cached_session.as_mut() {
                cached.user = user.clone();
            }
            if let ClientConnState::SignedInConnected { account_id, endpoint, .. } = &next.public {
                next.public = ClientConnState::SignedInConnected {
                    account_id: account_id.clone(),
                    endpoint: endpoint.clone(),
                    user,
                };
            }
        },
    }

    (next, commands)
}

#[cfg(test)]
mod tests {
    use moltis_protocol::{AccountId, UserIdentity};

    use super::*;

    fn user(account_id: &str) -> UserIdentity {
        UserIdentity {
            account_id: AccountId::parse(account_id).unwrap(),
            login: "octocat".into(),
            avatar_url: "https://example.com/a.png".into(),
            roles: vec![],
        }
    }

    // S1: cached-session reuse.
    #[test]
    fn cached_session_reuse_opens_channel_directly() {
        let state = ReducerState {
            cached_session: Some(CachedSession {
                account_id: "acct".into(),
                token: "cached-token".into(),
                expires_at_ms: 120_000,
                user: user("42"),
            }),
            ..ReducerState::default()
        };
        let (state, _) = reduce(
            &state,
            Event::UiConnect {
                origin: ConnectOrigin::User,
                endpoint: "http://h:8787".into(),
                interactive: false,
            },
        );
        assert!(matches!(state.pending, Some(Pending::ConnectSession { .. })));

        let (state, commands) = reduce(
            &state,
            Event::IdentityResult {
                ok: true,
                session: Some(crate::event::IdentitySession {
                    account_id: "acct".into(),
                    access_token: "gh".into(),
                }),
                error: None,
                now_ms: 0,
            },
        );
        assert_eq!(
            commands,
            vec![Command::ChannelOpen { endpoint: "http://h:8787".into(), token: "cached-token".into() }]
        );
        assert!(state.public.is_connecting());
    }

    // S2: expired within skew falls back to exchange.
    #[test]
    fn expired_cached_session_falls_back_to_exchange() {
        let state = ReducerState {
            cached_session: Some(CachedSession {
                account_id: "acct".into(),
                token: "cached-token".into(),
                expires_at_ms: 30_000,
                user: user("42"),
            }),
            pending: Some(Pending::ConnectSession {
                origin: ConnectOrigin::User,
                endpoint: "http://h:8787".into(),
                interactive: false,
            }),
            ..ReducerState::default()
        };
        let (_, commands) = reduce(
            &state,
            Event::IdentityResult {
                ok: true,
                session: Some(crate::event::IdentitySession {
                    account_id: "acct".into(),
                    access_token: "gh".into(),
                }),
                error: None,
                now_ms: 0,
            },
        );
        assert_eq!(
            commands,
            vec![Command::Exchange { endpoint: "http://h:8787".into(), access_token: "gh".into() }]
        );
    }

    // S3: single-shot 401 recovery.
    #[test]
    fn cached_session_401_triggers_single_shot_recovery() {
        let state = ReducerState {
            pending: Some(Pending::ConnectChannel {
                origin: ConnectOrigin::User,
                endpoint: "http://h:8787".into(),
                token: "cached-token".into(),
                access_token: "gh".into(),
                used_cached_session: true,
                recovered: false,
            }),
            ..ReducerState::default()
        };
        let (state, commands) = reduce(
            &state,
            Event::ChannelOpenResult {
                ok: false,
                error: Some(ChannelOpenErrorKind::HandshakeHttp {
                    status: 401,
                    retry_after_ms: None,
                    body_code: None,
                    body_text: None,
                }),
            },
        );
        assert_eq!(
            commands,
            vec![Command::Exchange { endpoint: "http://h:8787".into(), access_token: "gh".into() }]
        );
        assert_eq!(
            state.pending,
            Some(Pending::ConnectExchange {
                origin: ConnectOrigin::User,
                endpoint: "http://h:8787".into(),
                access_token: "gh".into(),
                recovered: true,
            })
        );

        // A second 401, now `recovered: true`, is not recovered again.
        let state_recovered = ReducerState {
            pending: Some(Pending::ConnectChannel {
                origin: ConnectOrigin::User,
                endpoint: "http://h:8787".into(),
                token: "new-token".into(),
                access_token: "gh".into(),
                used_cached_session: true,
                recovered: true,
            }),
            account_id: Some("acct".into()),
            ..ReducerState::default()
        };
        let (state2, commands2) = reduce(
            &state_recovered,
            Event::ChannelOpenResult {
                ok: false,
                error: Some(ChannelOpenErrorKind::HandshakeHttp {
                    status: 401,
                    retry_after_ms: None,
                    body_code: None,
                    body_text: None,
                }),
            },
        );
        assert!(state2.pending.is_none());
        assert!(matches!(state2.public, ClientConnState::SignedInDisconnected { .. }));
        assert!(commands2.iter().any(|c| matches!(c, Command::Telemetry { .. })));
    }

    // S4: exponential backoff schedule on an auto-reconnect close.
    #[test]
    fn channel_closed_schedules_backoff() {
        let state = ReducerState {
            public: ClientConnState::SignedInConnected {
                account_id: "acct".into(),
                endpoint: "http://h:8787".into(),
                user: user("42"),
            },
            account_id: Some("acct".into()),
            reconnect_attempt: 0,
            ..ReducerState::default()
        };
        let (state, commands) = reduce(&state, Event::ChannelClosed { auto_reconnect_enabled: true });
        assert_eq!(state.reconnect_attempt, 1);
        assert!(state.reconnect_scheduled);
        assert!(commands.contains(&Command::ReconnectSchedule { delay_ms: 500 }));
        assert!(commands.iter().any(|c| matches!(
            c,
            Command::Telemetry { event: "reconnect_scheduled", fields }
                if fields["attempt"] == 0 && fields["delayMs"] == 500
        )));
    }

    // S5: 429 on reconnect clamps to max(localBackoff, retryAfterMs).
    #[test]
    fn reconnect_429_clamps_to_retry_after() {
        let state = ReducerState {
            pending: Some(Pending::ConnectChannel {
                origin: ConnectOrigin::Reconnect,
                endpoint: "http://h:8787".into(),
                token: "t".into(),
                access_token: "gh".into(),
                used_cached_session: false,
                recovered: false,
            }),
            reconnect_attempt: 2,
            account_id: Some("acct".into()),
            ..ReducerState::default()
        };
        let (state, commands) = reduce(
            &state,
            Event::ChannelOpenResult {
                ok: false,
                error: Some(ChannelOpenErrorKind::HandshakeHttp {
                    status: 429,
                    retry_after_ms: Some(10_000),
                    body_code: None,
                    body_text: None,
                }),
            },
        );
        assert_eq!(state.reconnect_attempt, 3);
        assert!(state.reconnect_scheduled);
        assert!(commands.contains(&Command::ReconnectSchedule { delay_ms: 10_000 }));
    }

    // S6: canonical pairId is exercised in `moltis_protocol`; here we only
    // check the reducer never constructs one itself (out of its domain).

    #[test]
    fn at_most_one_pending_after_every_step() {
        let mut state = ReducerState::default();
        let events = vec![
            Event::UiSignIn,
            Event::IdentityResult {
                ok: true,
                session: Some(crate::event::IdentitySession {
                    account_id: "1".into(),
                    access_token: "gh".into(),
                }),
                error: None,
                now_ms: 0,
            },
            Event::UiConnect {
                origin: ConnectOrigin::User,
                endpoint: "http://h:8787".into(),
                interactive: true,
            },
        ];
        for event in events {
            let (next, _) = reduce(&state, event);
            // `Option<Pending>` structurally forbids more than one; this just
            // exercises the sequence without panicking.
            state = next;
        }
        assert!(state.pending.is_some() || state.pending.is_none());
    }

    #[test]
    fn non_interactive_connect_is_noop_when_suppressed() {
        let state = ReducerState { auth_suppressed_by_user: true, ..ReducerState::default() };
        let (next, commands) = reduce(
            &state,
            Event::UiConnect {
                origin: ConnectOrigin::Reconnect,
                endpoint: "http://h:8787".into(),
                interactive: false,
            },
        );
        assert_eq!(next, state);
        assert!(commands.is_empty());
    }

    #[test]
    fn timer_fired_redispatches_connect() {
        let state = ReducerState {
            account_id: Some("acct".into()),
            public: ClientConnState::SignedInDisconnected { account_id: "acct".into() },
            reconnect_scheduled: true,
            ..ReducerState::default()
        };
        let (state, commands) =
            reduce(&state, Event::TimerReconnectFired { endpoint: "http://h:8787".into() });
        assert!(!state.reconnect_scheduled || state.pending.is_some());
        assert!(commands.iter().any(|c| matches!(c, Command::GetIdentity { .. })));
    }
}
