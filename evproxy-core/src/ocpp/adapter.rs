//! Version-tagged codec between wire frames and the internal model.
//!
//! One adapter exists per charger (or outbound service) connection, selected
//! at session construction. It is a pure translator: the only state it owns
//! is the monotonic message-id counter; transaction bookkeeping lives in the
//! [`ChargerState`] the session manager passes in.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::command::{AvailabilityKind, ChargerCommand, ResetKind};
use crate::error::ProxyError;
use crate::event::ChargerEvent;
use crate::ocpp::frame::{ErrorCode, Frame, FrameError};
use crate::ocpp::version::ProtocolVersion;
use crate::ocpp::{v16, v201};

/// Heartbeat interval the proxy advertises in BootNotification responses.
const BOOT_INTERVAL_SECS: i64 = 10;

/// Per-connection transaction bookkeeping owned by the session manager.
#[derive(Debug, Clone)]
pub struct ChargerState {
    /// Charger-reported (or, for 1.6, proxy-assigned) id of the open
    /// transaction, if any.
    pub open_transaction: Option<String>,
    /// Next transaction id to hand out in 1.6 StartTransaction responses.
    pub next_tx_id: i64,
}

impl Default for ChargerState {
    fn default() -> Self {
        Self {
            open_transaction: None,
            next_tx_id: 1,
        }
    }
}

/// Outcome of decoding one inbound text frame.
#[derive(Debug)]
pub enum Decoded {
    /// A charger-initiated call that maps to an internal event. `reply` is
    /// the CallResult to send back on the same connection.
    Event { event: ChargerEvent, reply: Frame },
    /// A charger-initiated call that needs an answer but no event (unknown
    /// action, empty meter batch, payload error).
    Reply { reply: Frame },
    /// The charger answered one of our pending calls.
    CallAnswered {
        message_id: String,
        outcome: Result<Value, ProxyError>,
    },
}

pub struct ProtocolAdapter {
    version: ProtocolVersion,
    next_message_id: u64,
}

impl ProtocolAdapter {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            next_message_id: 1,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    fn next_id(&mut self) -> String {
        let id = self.next_message_id;
        self.next_message_id += 1;
        id.to_string()
    }

    /// Decode one inbound text frame from the charger.
    pub fn decode(&self, text: &str, state: &mut ChargerState) -> Result<Decoded, FrameError> {
        let frame = Frame::parse(text)?;
        Ok(match frame {
            Frame::Call {
                message_id,
                action,
                payload,
            } => self.decode_call(message_id, &action, payload, state),
            Frame::CallResult {
                message_id,
                payload,
            } => Decoded::CallAnswered {
                message_id,
                outcome: Ok(payload),
            },
            Frame::CallError {
                message_id,
                code,
                description,
                ..
            } => Decoded::CallAnswered {
                message_id,
                outcome: Err(ProxyError::ChargerRejected { code, description }),
            },
        })
    }

    fn decode_call(
        &self,
        message_id: String,
        action: &str,
        payload: Value,
        state: &mut ChargerState,
    ) -> Decoded {
        let decoded = match self.version {
            ProtocolVersion::V16 => decode_call_v16(&message_id, action, payload, state),
            ProtocolVersion::V201 => decode_call_v201(&message_id, action, payload, state),
        };
        match decoded {
            Ok(decoded) => decoded,
            Err(ProxyError::NotImplemented(action)) => Decoded::Reply {
                reply: Frame::error(message_id, ErrorCode::NotImplemented, action),
            },
            Err(err) => Decoded::Reply {
                reply: Frame::error(message_id, ErrorCode::FormatViolation, err.to_string()),
            },
        }
    }

    /// Encode an internal command into a wire Call. Returns the message id
    /// the session manager keys its pending-call table with.
    pub fn encode_command(
        &mut self,
        command: &ChargerCommand,
    ) -> Result<(String, String), ProxyError> {
        let (action, payload) = match self.version {
            ProtocolVersion::V16 => encode_command_v16(command)?,
            ProtocolVersion::V201 => encode_command_v201(command, self.next_message_id as i64)?,
        };
        let message_id = self.next_id();
        let frame = Frame::call(message_id.clone(), action, payload);
        Ok((message_id, frame.encode()))
    }

    /// Encode an internal event as a charge-point-originated Call, for the
    /// forward leg of outbound service connections. Returns `None` for
    /// events that have no wire representation.
    pub fn encode_event(
        &mut self,
        event: &ChargerEvent,
    ) -> Result<Option<(String, String)>, ProxyError> {
        let encoded = match self.version {
            ProtocolVersion::V16 => encode_event_v16(event)?,
            ProtocolVersion::V201 => encode_event_v201(event)?,
        };
        Ok(encoded.map(|(action, payload)| {
            let message_id = self.next_id();
            let frame = Frame::call(message_id.clone(), action, payload);
            (message_id, frame.encode())
        }))
    }
}

/// Translate a command-class Call received from a remote OCPP service into
/// the internal command it maps to. Uses the same action tables as the
/// charger-side codec.
pub fn decode_remote_command(
    version: ProtocolVersion,
    action: &str,
    payload: &Value,
) -> Result<ChargerCommand, ProxyError> {
    match version {
        ProtocolVersion::V16 => match action {
            "RemoteStartTransaction" => {
                let req: v16::RemoteStartTransactionRequest = parse(payload)?;
                Ok(ChargerCommand::RemoteStart {
                    id_tag: req.id_tag,
                    connector_id: req.connector_id.unwrap_or(1),
                })
            }
            "RemoteStopTransaction" => {
                let req: v16::RemoteStopTransactionRequest = parse(payload)?;
                Ok(ChargerCommand::RemoteStop {
                    transaction_id: req.transaction_id.to_string(),
                })
            }
            "Reset" => {
                let req: v16::ResetRequest = parse(payload)?;
                Ok(ChargerCommand::Reset {
                    kind: match req.kind {
                        v16::ResetType::Hard => ResetKind::Hard,
                        v16::ResetType::Soft => ResetKind::Soft,
                    },
                })
            }
            "ChangeAvailability" => {
                let req: v16::ChangeAvailabilityRequest = parse(payload)?;
                Ok(ChargerCommand::ChangeAvailability {
                    connector_id: req.connector_id,
                    kind: match req.kind {
                        v16::AvailabilityType::Operative => AvailabilityKind::Operative,
                        v16::AvailabilityType::Inoperative => AvailabilityKind::Inoperative,
                    },
                })
            }
            other => Err(ProxyError::NotImplemented(other.to_string())),
        },
        ProtocolVersion::V201 => match action {
            "RequestStartTransaction" => {
                let req: v201::RequestStartTransactionRequest = parse(payload)?;
                Ok(ChargerCommand::RemoteStart {
                    id_tag: req.id_token.id_token,
                    connector_id: req.evse_id.unwrap_or(1),
                })
            }
            "RequestStopTransaction" => {
                let req: v201::RequestStopTransactionRequest = parse(payload)?;
                Ok(ChargerCommand::RemoteStop {
                    transaction_id: req.transaction_id,
                })
            }
            "Reset" => {
                let req: v201::ResetRequest = parse(payload)?;
                Ok(ChargerCommand::Reset {
                    kind: match req.kind {
                        v201::ResetType::Immediate => ResetKind::Hard,
                        v201::ResetType::OnIdle => ResetKind::Soft,
                    },
                })
            }
            "ChangeAvailability" => {
                let req: v201::ChangeAvailabilityRequest = parse(payload)?;
                Ok(ChargerCommand::ChangeAvailability {
                    connector_id: req.evse.map(|e| e.id).unwrap_or(1),
                    kind: match req.operational_status {
                        v201::OperationalStatus::Operative => AvailabilityKind::Operative,
                        v201::OperationalStatus::Inoperative => AvailabilityKind::Inoperative,
                    },
                })
            }
            other => Err(ProxyError::NotImplemented(other.to_string())),
        },
    }
}

fn parse<T: DeserializeOwned>(payload: &Value) -> Result<T, ProxyError> {
    serde_json::from_value(payload.clone())
        .map_err(|e| ProxyError::MalformedPayload(e.to_string()))
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    // Our payload types serialize infallibly.
    serde_json::to_value(value).unwrap_or(Value::Null)
}

// ---------------------------------------------------------------------------
// OCPP 1.6
// ---------------------------------------------------------------------------

fn decode_call_v16(
    message_id: &str,
    action: &str,
    payload: Value,
    state: &mut ChargerState,
) -> Result<Decoded, ProxyError> {
    match action {
        "BootNotification" => {
            let req: v16::BootNotificationRequest = parse(&payload)?;
            let reply = Frame::result(
                message_id,
                to_value(&v16::BootNotificationResponse {
                    current_time: Utc::now(),
                    interval: BOOT_INTERVAL_SECS,
                    status: v16::RegistrationStatus::Accepted,
                }),
            );
            Ok(Decoded::Event {
                event: ChargerEvent::BootNotification {
                    vendor: req.charge_point_vendor,
                    model: req.charge_point_model,
                },
                reply,
            })
        }
        "Heartbeat" => {
            let now = Utc::now();
            let reply = Frame::result(
                message_id,
                to_value(&v16::HeartbeatResponse { current_time: now }),
            );
            Ok(Decoded::Event {
                event: ChargerEvent::Heartbeat { time: now },
                reply,
            })
        }
        "StatusNotification" => {
            let req: v16::StatusNotificationRequest = parse(&payload)?;
            let error_code = Some(req.error_code).filter(|c| c != "NoError");
            let reply = Frame::result(message_id, json!({}));
            Ok(Decoded::Event {
                event: ChargerEvent::StatusChanged {
                    connector_id: req.connector_id,
                    status: req.status,
                    error_code,
                },
                reply,
            })
        }
        "MeterValues" => {
            let req: v16::MeterValuesRequest = parse(&payload)?;
            let reply = Frame::result(message_id, json!({}));
            match v16::energy_sample_wh(&req.meter_value) {
                Some((energy_wh, timestamp)) => Ok(Decoded::Event {
                    event: ChargerEvent::MeterSample {
                        connector_id: req.connector_id,
                        energy_wh,
                        timestamp,
                    },
                    reply,
                }),
                None => Ok(Decoded::Reply { reply }),
            }
        }
        "StartTransaction" => {
            let req: v16::StartTransactionRequest = parse(&payload)?;
            // 1.6 chargers expect the CSMS to assign the transaction id.
            let tx_id = state.next_tx_id;
            state.next_tx_id += 1;
            state.open_transaction = Some(tx_id.to_string());
            let reply = Frame::result(
                message_id,
                to_value(&v16::StartTransactionResponse {
                    transaction_id: tx_id,
                    id_tag_info: v16::IdTagInfo {
                        status: v16::AuthorizationStatus::Accepted,
                    },
                }),
            );
            Ok(Decoded::Event {
                event: ChargerEvent::TransactionStarted {
                    transaction_id: tx_id.to_string(),
                    connector_id: req.connector_id,
                    id_tag: req.id_tag,
                    meter_start_wh: req.meter_start as f64,
                    timestamp: req.timestamp,
                },
                reply,
            })
        }
        "StopTransaction" => {
            let req: v16::StopTransactionRequest = parse(&payload)?;
            state.open_transaction = None;
            let reply = Frame::result(
                message_id,
                to_value(&v16::StopTransactionResponse {
                    id_tag_info: Some(v16::IdTagInfo {
                        status: v16::AuthorizationStatus::Accepted,
                    }),
                }),
            );
            Ok(Decoded::Event {
                event: ChargerEvent::TransactionEnded {
                    transaction_id: req.transaction_id.to_string(),
                    meter_stop_wh: req.meter_stop as f64,
                    timestamp: req.timestamp,
                    reason: req.reason,
                },
                reply,
            })
        }
        other => Err(ProxyError::NotImplemented(other.to_string())),
    }
}

fn encode_command_v16(command: &ChargerCommand) -> Result<(&'static str, Value), ProxyError> {
    match command {
        ChargerCommand::RemoteStart {
            id_tag,
            connector_id,
        } => Ok((
            "RemoteStartTransaction",
            to_value(&v16::RemoteStartTransactionRequest {
                id_tag: id_tag.clone(),
                connector_id: Some(*connector_id),
            }),
        )),
        ChargerCommand::RemoteStop { transaction_id } => {
            let transaction_id = transaction_id.parse::<i64>().map_err(|_| {
                ProxyError::MalformedPayload(format!(
                    "1.6 transaction id must be numeric: {transaction_id}"
                ))
            })?;
            Ok((
                "RemoteStopTransaction",
                to_value(&v16::RemoteStopTransactionRequest { transaction_id }),
            ))
        }
        ChargerCommand::Reset { kind } => Ok((
            "Reset",
            to_value(&v16::ResetRequest {
                kind: match kind {
                    ResetKind::Hard => v16::ResetType::Hard,
                    ResetKind::Soft => v16::ResetType::Soft,
                },
            }),
        )),
        ChargerCommand::ChangeAvailability { connector_id, kind } => Ok((
            "ChangeAvailability",
            to_value(&v16::ChangeAvailabilityRequest {
                connector_id: *connector_id,
                kind: match kind {
                    AvailabilityKind::Operative => v16::AvailabilityType::Operative,
                    AvailabilityKind::Inoperative => v16::AvailabilityType::Inoperative,
                },
            }),
        )),
    }
}

fn encode_event_v16(
    event: &ChargerEvent,
) -> Result<Option<(&'static str, Value)>, ProxyError> {
    match event {
        ChargerEvent::BootNotification { vendor, model } => Ok(Some((
            "BootNotification",
            to_value(&v16::BootNotificationRequest {
                charge_point_vendor: vendor.clone(),
                charge_point_model: model.clone(),
                charge_point_serial_number: None,
                firmware_version: None,
            }),
        ))),
        ChargerEvent::Heartbeat { .. } => Ok(Some(("Heartbeat", json!({})))),
        ChargerEvent::StatusChanged {
            connector_id,
            status,
            error_code,
        } => {
            // Unknown is not a legal 1.6 state on the wire.
            let status = match status {
                crate::status::ChargerStatus::Unknown => crate::status::ChargerStatus::Unavailable,
                other => *other,
            };
            Ok(Some((
                "StatusNotification",
                to_value(&v16::StatusNotificationRequest {
                    connector_id: *connector_id,
                    error_code: error_code.clone().unwrap_or_else(|| "NoError".to_string()),
                    status,
                    info: None,
                    timestamp: None,
                }),
            )))
        }
        ChargerEvent::MeterSample {
            connector_id,
            energy_wh,
            timestamp,
        } => Ok(Some((
            "MeterValues",
            to_value(&v16::MeterValuesRequest {
                connector_id: *connector_id,
                transaction_id: None,
                meter_value: vec![v16::MeterValue {
                    timestamp: *timestamp,
                    sampled_value: vec![v16::SampledValue {
                        value: format_wh(*energy_wh),
                        measurand: Some(v16::ENERGY_REGISTER.to_string()),
                        unit: Some("Wh".to_string()),
                        context: None,
                    }],
                }],
            }),
        ))),
        ChargerEvent::TransactionStarted {
            connector_id,
            id_tag,
            meter_start_wh,
            timestamp,
            ..
        } => Ok(Some((
            "StartTransaction",
            to_value(&v16::StartTransactionRequest {
                connector_id: *connector_id,
                id_tag: id_tag.clone(),
                meter_start: *meter_start_wh as i64,
                timestamp: *timestamp,
                reservation_id: None,
            }),
        ))),
        ChargerEvent::TransactionEnded {
            transaction_id,
            meter_stop_wh,
            timestamp,
            reason,
        } => {
            let transaction_id = transaction_id.parse::<i64>().map_err(|_| {
                ProxyError::MalformedPayload(format!(
                    "1.6 transaction id must be numeric: {transaction_id}"
                ))
            })?;
            Ok(Some((
                "StopTransaction",
                to_value(&v16::StopTransactionRequest {
                    transaction_id,
                    meter_stop: *meter_stop_wh as i64,
                    timestamp: *timestamp,
                    reason: reason.clone(),
                    id_tag: None,
                }),
            )))
        }
        ChargerEvent::ChargerDisconnected => Ok(None),
    }
}

fn format_wh(wh: f64) -> String {
    if wh.fract() == 0.0 {
        format!("{}", wh as i64)
    } else {
        format!("{wh}")
    }
}

// ---------------------------------------------------------------------------
// OCPP 2.0.1
// ---------------------------------------------------------------------------

fn decode_call_v201(
    message_id: &str,
    action: &str,
    payload: Value,
    state: &mut ChargerState,
) -> Result<Decoded, ProxyError> {
    match action {
        "BootNotification" => {
            let req: v201::BootNotificationRequest = parse(&payload)?;
            let reply = Frame::result(
                message_id,
                to_value(&v201::BootNotificationResponse {
                    current_time: Utc::now(),
                    interval: BOOT_INTERVAL_SECS,
                    status: v201::RegistrationStatus::Accepted,
                }),
            );
            Ok(Decoded::Event {
                event: ChargerEvent::BootNotification {
                    vendor: req.charging_station.vendor_name,
                    model: req.charging_station.model,
                },
                reply,
            })
        }
        "Heartbeat" => {
            let now = Utc::now();
            let reply = Frame::result(
                message_id,
                to_value(&v201::HeartbeatResponse { current_time: now }),
            );
            Ok(Decoded::Event {
                event: ChargerEvent::Heartbeat { time: now },
                reply,
            })
        }
        "StatusNotification" => {
            let req: v201::StatusNotificationRequest = parse(&payload)?;
            let status = req
                .connector_status
                .to_unified(state.open_transaction.is_some());
            let reply = Frame::result(message_id, json!({}));
            Ok(Decoded::Event {
                event: ChargerEvent::StatusChanged {
                    connector_id: req.evse_id,
                    status,
                    error_code: None,
                },
                reply,
            })
        }
        "MeterValues" => {
            let req: v201::MeterValuesRequest = parse(&payload)?;
            let reply = Frame::result(message_id, json!({}));
            match v201::energy_sample_wh(&req.meter_value) {
                Some((energy_wh, timestamp)) => Ok(Decoded::Event {
                    event: ChargerEvent::MeterSample {
                        connector_id: req.evse_id,
                        energy_wh,
                        timestamp,
                    },
                    reply,
                }),
                None => Ok(Decoded::Reply { reply }),
            }
        }
        "TransactionEvent" => {
            let req: v201::TransactionEventRequest = parse(&payload)?;
            let tx_id = req.transaction_info.transaction_id.clone();
            let connector_id = req.evse.as_ref().map(|e| e.id).unwrap_or(1);
            let meter = req
                .meter_value
                .as_deref()
                .and_then(v201::energy_sample_wh);
            let accepted = Frame::result(
                message_id,
                to_value(&v201::TransactionEventResponse {
                    id_token_info: Some(v201::IdTokenInfo {
                        status: v201::AuthorizationStatus::Accepted,
                    }),
                }),
            );
            match req.event_type {
                v201::TransactionEventType::Started => {
                    state.open_transaction = Some(tx_id.clone());
                    Ok(Decoded::Event {
                        event: ChargerEvent::TransactionStarted {
                            transaction_id: tx_id,
                            connector_id,
                            id_tag: req
                                .id_token
                                .map(|t| t.id_token)
                                .unwrap_or_default(),
                            meter_start_wh: meter.map(|(wh, _)| wh).unwrap_or(0.0),
                            timestamp: req.timestamp,
                        },
                        reply: accepted,
                    })
                }
                v201::TransactionEventType::Ended => {
                    state.open_transaction = None;
                    Ok(Decoded::Event {
                        event: ChargerEvent::TransactionEnded {
                            transaction_id: tx_id,
                            meter_stop_wh: meter.map(|(wh, _)| wh).unwrap_or(0.0),
                            timestamp: req.timestamp,
                            reason: req.transaction_info.stopped_reason,
                        },
                        reply: accepted,
                    })
                }
                v201::TransactionEventType::Updated => {
                    let reply = Frame::result(
                        message_id,
                        to_value(&v201::TransactionEventResponse {
                            id_token_info: None,
                        }),
                    );
                    match meter {
                        Some((energy_wh, timestamp)) => Ok(Decoded::Event {
                            event: ChargerEvent::MeterSample {
                                connector_id,
                                energy_wh,
                                timestamp,
                            },
                            reply,
                        }),
                        None => Ok(Decoded::Reply { reply }),
                    }
                }
            }
        }
        other => Err(ProxyError::NotImplemented(other.to_string())),
    }
}

fn encode_command_v201(
    command: &ChargerCommand,
    remote_start_id: i64,
) -> Result<(&'static str, Value), ProxyError> {
    match command {
        ChargerCommand::RemoteStart {
            id_tag,
            connector_id,
        } => Ok((
            "RequestStartTransaction",
            to_value(&v201::RequestStartTransactionRequest {
                id_token: v201::IdToken {
                    id_token: id_tag.clone(),
                    kind: "Central".to_string(),
                },
                remote_start_id,
                evse_id: Some(*connector_id),
            }),
        )),
        ChargerCommand::RemoteStop { transaction_id } => Ok((
            "RequestStopTransaction",
            to_value(&v201::RequestStopTransactionRequest {
                transaction_id: transaction_id.clone(),
            }),
        )),
        ChargerCommand::Reset { kind } => Ok((
            "Reset",
            to_value(&v201::ResetRequest {
                kind: match kind {
                    ResetKind::Hard => v201::ResetType::Immediate,
                    ResetKind::Soft => v201::ResetType::OnIdle,
                },
                evse_id: None,
            }),
        )),
        ChargerCommand::ChangeAvailability { connector_id, kind } => Ok((
            "ChangeAvailability",
            to_value(&v201::ChangeAvailabilityRequest {
                operational_status: match kind {
                    AvailabilityKind::Operative => v201::OperationalStatus::Operative,
                    AvailabilityKind::Inoperative => v201::OperationalStatus::Inoperative,
                },
                evse: Some(v201::Evse {
                    id: *connector_id,
                    connector_id: None,
                }),
            }),
        )),
    }
}

fn encode_event_v201(
    event: &ChargerEvent,
) -> Result<Option<(&'static str, Value)>, ProxyError> {
    match event {
        ChargerEvent::BootNotification { vendor, model } => Ok(Some((
            "BootNotification",
            to_value(&v201::BootNotificationRequest {
                charging_station: v201::ChargingStation {
                    model: model.clone(),
                    vendor_name: vendor.clone(),
                    serial_number: None,
                    firmware_version: None,
                },
                reason: "PowerUp".to_string(),
            }),
        ))),
        ChargerEvent::Heartbeat { .. } => Ok(Some(("Heartbeat", json!({})))),
        ChargerEvent::StatusChanged {
            connector_id,
            status,
            ..
        } => Ok(Some((
            "StatusNotification",
            to_value(&v201::StatusNotificationRequest {
                timestamp: Utc::now(),
                connector_status: v201::ConnectorStatus::from_unified(*status),
                evse_id: *connector_id,
                connector_id: 1,
            }),
        ))),
        ChargerEvent::MeterSample {
            connector_id,
            energy_wh,
            timestamp,
        } => Ok(Some((
            "MeterValues",
            to_value(&v201::MeterValuesRequest {
                evse_id: *connector_id,
                meter_value: vec![v201::MeterValue {
                    timestamp: *timestamp,
                    sampled_value: vec![v201::SampledValue {
                        value: *energy_wh,
                        measurand: Some(v201::ENERGY_REGISTER.to_string()),
                        context: None,
                    }],
                }],
            }),
        ))),
        ChargerEvent::TransactionStarted {
            transaction_id,
            connector_id,
            id_tag,
            meter_start_wh,
            timestamp,
        } => Ok(Some((
            "TransactionEvent",
            to_value(&v201::TransactionEventRequest {
                event_type: v201::TransactionEventType::Started,
                timestamp: *timestamp,
                trigger_reason: "Authorized".to_string(),
                seq_no: 0,
                transaction_info: v201::TransactionInfo {
                    transaction_id: transaction_id.clone(),
                    charging_state: None,
                    stopped_reason: None,
                },
                evse: Some(v201::Evse {
                    id: *connector_id,
                    connector_id: None,
                }),
                id_token: Some(v201::IdToken {
                    id_token: id_tag.clone(),
                    kind: "Central".to_string(),
                }),
                meter_value: Some(vec![v201::MeterValue {
                    timestamp: *timestamp,
                    sampled_value: vec![v201::SampledValue {
                        value: *meter_start_wh,
                        measurand: Some(v201::ENERGY_REGISTER.to_string()),
                        context: None,
                    }],
                }]),
            }),
        ))),
        ChargerEvent::TransactionEnded {
            transaction_id,
            meter_stop_wh,
            timestamp,
            reason,
        } => Ok(Some((
            "TransactionEvent",
            to_value(&v201::TransactionEventRequest {
                event_type: v201::TransactionEventType::Ended,
                timestamp: *timestamp,
                trigger_reason: "StopAuthorized".to_string(),
                seq_no: 0,
                transaction_info: v201::TransactionInfo {
                    transaction_id: transaction_id.clone(),
                    charging_state: None,
                    stopped_reason: reason.clone(),
                },
                evse: None,
                id_token: None,
                meter_value: Some(vec![v201::MeterValue {
                    timestamp: *timestamp,
                    sampled_value: vec![v201::SampledValue {
                        value: *meter_stop_wh,
                        measurand: Some(v201::ENERGY_REGISTER.to_string()),
                        context: None,
                    }],
                }]),
            }),
        ))),
        ChargerEvent::ChargerDisconnected => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::ChargerStatus;

    fn decode_one(
        adapter: &ProtocolAdapter,
        state: &mut ChargerState,
        text: &str,
    ) -> (ChargerEvent, Frame) {
        match adapter.decode(text, state).unwrap() {
            Decoded::Event { event, reply } => (event, reply),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn v16_start_transaction_assigns_monotonic_ids() {
        let adapter = ProtocolAdapter::new(ProtocolVersion::V16);
        let mut state = ChargerState::default();
        let text = r#"[2,"m1","StartTransaction",{"connectorId":1,"idTag":"ABC","meterStart":1000,"timestamp":"2026-03-01T10:00:00Z"}]"#;

        let (event, reply) = decode_one(&adapter, &mut state, text);
        match event {
            ChargerEvent::TransactionStarted {
                transaction_id,
                meter_start_wh,
                ..
            } => {
                assert_eq!(transaction_id, "1");
                assert_eq!(meter_start_wh, 1000.0);
            }
            other => panic!("wrong event: {other:?}"),
        }
        match reply {
            Frame::CallResult { payload, .. } => {
                assert_eq!(payload["transactionId"], 1);
                assert_eq!(payload["idTagInfo"]["status"], "Accepted");
            }
            other => panic!("wrong reply: {other:?}"),
        }
        assert_eq!(state.open_transaction.as_deref(), Some("1"));
        assert_eq!(state.next_tx_id, 2);
    }

    #[test]
    fn v16_stop_transaction_closes_state() {
        let adapter = ProtocolAdapter::new(ProtocolVersion::V16);
        let mut state = ChargerState {
            open_transaction: Some("1".into()),
            next_tx_id: 2,
        };
        let text = r#"[2,"m2","StopTransaction",{"transactionId":1,"meterStop":4500,"timestamp":"2026-03-01T11:00:00Z","reason":"Remote"}]"#;
        let (event, _) = decode_one(&adapter, &mut state, text);
        assert_eq!(
            event,
            ChargerEvent::TransactionEnded {
                transaction_id: "1".into(),
                meter_stop_wh: 4500.0,
                timestamp: "2026-03-01T11:00:00Z".parse().unwrap(),
                reason: Some("Remote".into()),
            }
        );
        assert!(state.open_transaction.is_none());
    }

    #[test]
    fn v16_unknown_action_gets_not_implemented() {
        let adapter = ProtocolAdapter::new(ProtocolVersion::V16);
        let mut state = ChargerState::default();
        let decoded = adapter
            .decode(r#"[2,"m1","DataTransfer",{}]"#, &mut state)
            .unwrap();
        match decoded {
            Decoded::Reply {
                reply: Frame::CallError { code, .. },
            } => assert_eq!(code, "NotImplemented"),
            other => panic!("expected CallError, got {other:?}"),
        }
    }

    #[test]
    fn v16_malformed_payload_gets_format_violation() {
        let adapter = ProtocolAdapter::new(ProtocolVersion::V16);
        let mut state = ChargerState::default();
        let decoded = adapter
            .decode(r#"[2,"m1","StartTransaction",{"connectorId":"one"}]"#, &mut state)
            .unwrap();
        match decoded {
            Decoded::Reply {
                reply: Frame::CallError { code, .. },
            } => assert_eq!(code, "FormatViolation"),
            other => panic!("expected CallError, got {other:?}"),
        }
    }

    #[test]
    fn call_result_completes_pending_call() {
        let adapter = ProtocolAdapter::new(ProtocolVersion::V16);
        let mut state = ChargerState::default();
        let decoded = adapter
            .decode(r#"[3,"17",{"status":"Accepted"}]"#, &mut state)
            .unwrap();
        match decoded {
            Decoded::CallAnswered {
                message_id,
                outcome,
            } => {
                assert_eq!(message_id, "17");
                assert_eq!(outcome.unwrap()["status"], "Accepted");
            }
            other => panic!("expected answer, got {other:?}"),
        }
    }

    #[test]
    fn call_error_surfaces_charger_code() {
        let adapter = ProtocolAdapter::new(ProtocolVersion::V16);
        let mut state = ChargerState::default();
        let decoded = adapter
            .decode(r#"[4,"17","NotSupported","nope",{}]"#, &mut state)
            .unwrap();
        match decoded {
            Decoded::CallAnswered { outcome, .. } => {
                assert_eq!(outcome.unwrap_err().code(), "NotSupported");
            }
            other => panic!("expected answer, got {other:?}"),
        }
    }

    #[test]
    fn v201_occupied_maps_by_open_transaction() {
        let adapter = ProtocolAdapter::new(ProtocolVersion::V201);
        let text = r#"[2,"m1","StatusNotification",{"timestamp":"2026-03-01T10:00:00Z","connectorStatus":"Occupied","evseId":1,"connectorId":1}]"#;

        let mut idle = ChargerState::default();
        let (event, _) = decode_one(&adapter, &mut idle, text);
        assert!(matches!(
            event,
            ChargerEvent::StatusChanged {
                status: ChargerStatus::Preparing,
                ..
            }
        ));

        let mut charging = ChargerState {
            open_transaction: Some("tx".into()),
            next_tx_id: 1,
        };
        let (event, _) = decode_one(&adapter, &mut charging, text);
        assert!(matches!(
            event,
            ChargerEvent::StatusChanged {
                status: ChargerStatus::Charging,
                ..
            }
        ));
    }

    #[test]
    fn v201_transaction_event_matches_v16_internal_event() {
        // S5: a 2.0.1 TransactionEvent Started produces the same internal
        // event as the 1.6 StartTransaction would.
        let v201 = ProtocolAdapter::new(ProtocolVersion::V201);
        let mut state = ChargerState::default();
        let text = r#"[2,"m1","TransactionEvent",{
            "eventType":"Started","timestamp":"2026-03-01T10:00:00Z",
            "triggerReason":"Authorized","seqNo":0,
            "transactionInfo":{"transactionId":"1"},
            "evse":{"id":1},
            "idToken":{"idToken":"ABC","type":"Central"},
            "meterValue":[{"timestamp":"2026-03-01T10:00:00Z","sampledValue":[{"value":1000.0}]}]
        }]"#;
        let (event, _) = decode_one(&v201, &mut state, text);

        let v16 = ProtocolAdapter::new(ProtocolVersion::V16);
        let mut v16_state = ChargerState::default();
        let (expected, _) = decode_one(
            &v16,
            &mut v16_state,
            r#"[2,"m1","StartTransaction",{"connectorId":1,"idTag":"ABC","meterStart":1000,"timestamp":"2026-03-01T10:00:00Z"}]"#,
        );
        assert_eq!(event, expected);
        assert_eq!(state.open_transaction.as_deref(), Some("1"));
    }

    #[test]
    fn command_encoding_v16() {
        let mut adapter = ProtocolAdapter::new(ProtocolVersion::V16);
        let (id, text) = adapter
            .encode_command(&ChargerCommand::RemoteStart {
                id_tag: "ABC".into(),
                connector_id: 1,
            })
            .unwrap();
        assert_eq!(id, "1");
        match Frame::parse(&text).unwrap() {
            Frame::Call {
                action, payload, ..
            } => {
                assert_eq!(action, "RemoteStartTransaction");
                assert_eq!(payload["idTag"], "ABC");
                assert_eq!(payload["connectorId"], 1);
            }
            other => panic!("expected Call, got {other:?}"),
        }

        // Message ids are a monotonic counter rendered as decimal strings.
        let (id, _) = adapter
            .encode_command(&ChargerCommand::Reset {
                kind: ResetKind::Hard,
            })
            .unwrap();
        assert_eq!(id, "2");
    }

    #[test]
    fn command_encoding_v201() {
        let mut adapter = ProtocolAdapter::new(ProtocolVersion::V201);
        let (_, text) = adapter
            .encode_command(&ChargerCommand::RemoteStop {
                transaction_id: "tx-7".into(),
            })
            .unwrap();
        match Frame::parse(&text).unwrap() {
            Frame::Call {
                action, payload, ..
            } => {
                assert_eq!(action, "RequestStopTransaction");
                assert_eq!(payload["transactionId"], "tx-7");
            }
            other => panic!("expected Call, got {other:?}"),
        }

        let (_, text) = adapter
            .encode_command(&ChargerCommand::Reset {
                kind: ResetKind::Soft,
            })
            .unwrap();
        match Frame::parse(&text).unwrap() {
            Frame::Call { payload, .. } => assert_eq!(payload["type"], "OnIdle"),
            other => panic!("expected Call, got {other:?}"),
        }
    }

    #[test]
    fn v16_remote_stop_rejects_non_numeric_transaction() {
        let mut adapter = ProtocolAdapter::new(ProtocolVersion::V16);
        let err = adapter
            .encode_command(&ChargerCommand::RemoteStop {
                transaction_id: "tx-7".into(),
            })
            .unwrap_err();
        assert!(matches!(err, ProxyError::MalformedPayload(_)));
    }

    fn round_trip(version: ProtocolVersion, event: ChargerEvent, state: &mut ChargerState) {
        let mut adapter = ProtocolAdapter::new(version);
        let (_, text) = adapter.encode_event(&event).unwrap().unwrap();
        let (decoded, _) = match adapter.decode(&text, state).unwrap() {
            Decoded::Event { event, reply } => (event, reply),
            other => panic!("expected event, got {other:?}"),
        };
        assert_eq!(decoded, event);
    }

    #[test]
    fn wire_round_trip_identity_v16() {
        let ts = "2026-03-01T10:00:00Z".parse().unwrap();
        let mut state = ChargerState::default();
        round_trip(
            ProtocolVersion::V16,
            ChargerEvent::BootNotification {
                vendor: "ACME".into(),
                model: "Wallbox".into(),
            },
            &mut state,
        );
        round_trip(
            ProtocolVersion::V16,
            ChargerEvent::StatusChanged {
                connector_id: 1,
                status: ChargerStatus::Charging,
                error_code: None,
            },
            &mut state,
        );
        round_trip(
            ProtocolVersion::V16,
            ChargerEvent::MeterSample {
                connector_id: 1,
                energy_wh: 2500.0,
                timestamp: ts,
            },
            &mut state,
        );
        // The 1.6 decoder assigns the transaction id itself, so line the
        // counter up with the encoded event first.
        let mut state = ChargerState {
            open_transaction: None,
            next_tx_id: 7,
        };
        round_trip(
            ProtocolVersion::V16,
            ChargerEvent::TransactionStarted {
                transaction_id: "7".into(),
                connector_id: 1,
                id_tag: "ABC".into(),
                meter_start_wh: 1000.0,
                timestamp: ts,
            },
            &mut state,
        );
        round_trip(
            ProtocolVersion::V16,
            ChargerEvent::TransactionEnded {
                transaction_id: "7".into(),
                meter_stop_wh: 4500.0,
                timestamp: ts,
                reason: Some("Remote".into()),
            },
            &mut state,
        );
    }

    #[test]
    fn wire_round_trip_identity_v201() {
        let ts = "2026-03-01T10:00:00Z".parse().unwrap();
        let mut state = ChargerState::default();
        round_trip(
            ProtocolVersion::V201,
            ChargerEvent::BootNotification {
                vendor: "ACME".into(),
                model: "Wallbox".into(),
            },
            &mut state,
        );
        round_trip(
            ProtocolVersion::V201,
            ChargerEvent::MeterSample {
                connector_id: 1,
                energy_wh: 2500.0,
                timestamp: ts,
            },
            &mut state,
        );
        round_trip(
            ProtocolVersion::V201,
            ChargerEvent::TransactionStarted {
                transaction_id: "tx-1".into(),
                connector_id: 1,
                id_tag: "ABC".into(),
                meter_start_wh: 1000.0,
                timestamp: ts,
            },
            &mut state,
        );
        round_trip(
            ProtocolVersion::V201,
            ChargerEvent::TransactionEnded {
                transaction_id: "tx-1".into(),
                meter_stop_wh: 4500.0,
                timestamp: ts,
                reason: Some("Remote".into()),
            },
            &mut state,
        );
    }

    #[test]
    fn remote_command_translation_uses_same_tables() {
        let cmd = decode_remote_command(
            ProtocolVersion::V16,
            "RemoteStartTransaction",
            &json!({"idTag": "ABC", "connectorId": 2}),
        )
        .unwrap();
        assert_eq!(
            cmd,
            ChargerCommand::RemoteStart {
                id_tag: "ABC".into(),
                connector_id: 2
            }
        );

        let cmd = decode_remote_command(
            ProtocolVersion::V201,
            "RequestStopTransaction",
            &json!({"transactionId": "tx-3"}),
        )
        .unwrap();
        assert_eq!(
            cmd,
            ChargerCommand::RemoteStop {
                transaction_id: "tx-3".into()
            }
        );

        assert!(matches!(
            decode_remote_command(ProtocolVersion::V16, "GetDiagnostics", &json!({})),
            Err(ProxyError::NotImplemented(_))
        ));
    }
}
