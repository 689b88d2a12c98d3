/********************************************************************************
 * Copyright (c) 2024 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! The bus facade binding one endpoint's receivers and outgoing routes.

use crate::control_plane::registry::{BusEvent, LifecycleHandler};
use crate::data_plane::connection_pool::ConnectionPool;
use crate::data_plane::listener::CompatibilityKey;
use crate::data_plane::receiver::Receiver;
use crate::errors::BusError;
use crate::label::MessageLabel;
use crate::observability::events;
use crate::routing::consumer::MessageConsumer;
use crate::routing::route_table::RouteTable;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

const COMPONENT: &str = "bus";

type ListenerIndex = Arc<StdMutex<HashMap<(String, String), CompatibilityKey>>>;

/// One endpoint's running bus: receivers for its subscriptions, the outgoing
/// route table, and the shared connection pool.
pub struct Bus {
    endpoint_name: String,
    receivers: Vec<Arc<Receiver>>,
    routes: RouteTable,
    pool: Arc<ConnectionPool>,
    lifecycle_handler: Option<Arc<dyn LifecycleHandler>>,
    cancellation: CancellationToken,
    listener_index: ListenerIndex,
    started: Mutex<bool>,
}

impl Bus {
    pub(crate) fn new(
        endpoint_name: String,
        receivers: Vec<Arc<Receiver>>,
        routes: RouteTable,
        pool: Arc<ConnectionPool>,
        lifecycle_handler: Option<Arc<dyn LifecycleHandler>>,
        cancellation: CancellationToken,
        listener_index: ListenerIndex,
    ) -> Self {
        Self {
            endpoint_name,
            receivers,
            routes,
            pool,
            lifecycle_handler,
            cancellation,
            listener_index,
            started: Mutex::new(false),
        }
    }

    /// Name of the endpoint this bus serves.
    pub fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    /// Receivers for the endpoint's subscriptions.
    pub fn receivers(&self) -> &[Arc<Receiver>] {
        &self.receivers
    }

    /// Outgoing route table.
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Starts every receiver, then notifies the lifecycle handler. Idempotent.
    pub async fn start(&self) -> Result<(), BusError> {
        let mut started = self.started.lock().await;
        if *started {
            return Ok(());
        }
        for receiver in &self.receivers {
            receiver.start().await?;
        }
        *started = true;

        if let Some(handler) = &self.lifecycle_handler {
            handler
                .on_started(&BusEvent {
                    endpoint: self.endpoint_name.clone(),
                })
                .await;
        }
        info!(
            event = events::BUS_STARTED,
            component = COMPONENT,
            endpoint = %self.endpoint_name,
            receivers = self.receivers.len(),
            "bus started"
        );
        Ok(())
    }

    /// Notifies the lifecycle handler, then stops receivers and closes pooled
    /// connections. Best-effort and idempotent.
    pub async fn stop(&self) {
        let mut started = self.started.lock().await;
        if !*started {
            return;
        }
        if let Some(handler) = &self.lifecycle_handler {
            handler
                .on_stopping(&BusEvent {
                    endpoint: self.endpoint_name.clone(),
                })
                .await;
        }
        for receiver in &self.receivers {
            receiver.stop().await;
        }
        self.pool.close_all().await;
        self.listener_index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *started = false;
        info!(
            event = events::BUS_STOPPED,
            component = COMPONENT,
            endpoint = %self.endpoint_name,
            "bus stopped"
        );
    }

    /// Cancels all pending work, then stops.
    pub async fn shutdown(&self) {
        self.cancellation.cancel();
        self.stop().await;
    }

    /// Whether any subscription serves `label`. Builds receivers lazily.
    pub async fn can_receive(&self, label: &MessageLabel) -> Result<bool, BusError> {
        for receiver in &self.receivers {
            if receiver.can_receive(label).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// First receiver serving `label`, if any. Builds receivers lazily.
    pub async fn receiver_of(&self, label: &MessageLabel) -> Result<Option<Arc<Receiver>>, BusError> {
        for receiver in &self.receivers {
            if receiver.can_receive(label).await? {
                return Ok(Some(receiver.clone()));
            }
        }
        Ok(None)
    }

    /// Registers a consumer on the receiver configured for `label`.
    pub async fn register_consumer(
        &self,
        label: MessageLabel,
        consumer: Arc<dyn MessageConsumer>,
    ) -> Result<(), BusError> {
        let receiver = self
            .receivers
            .iter()
            .find(|receiver| receiver.configuration_label() == &label)
            .ok_or_else(|| BusError::NotFound {
                endpoint: self.endpoint_name.clone(),
                key: label.as_str().to_string(),
            })?;
        receiver.register_consumer(label, consumer).await;
        Ok(())
    }
}
