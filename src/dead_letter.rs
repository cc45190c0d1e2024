// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dead-Letter Routing
//!
//! A dead-letter route is a durable exchange plus a durable queue bound to it.
//! A primary queue is "protected" by pointing its `x-dead-letter-exchange`
//! argument at the route. From then on the broker moves every message the
//! consumer rejects without requeue (or that outlives the queue TTL) into the
//! dead-letter queue. Nothing in this crate consumes from it: it is an
//! append-only side channel for manual inspection.

use crate::{
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    topology::AmqpTopology,
};

/// A dead-letter exchange and the queue that collects its messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRoute {
    exchange: String,
    queue: String,
}

impl DeadLetterRoute {
    pub fn new(exchange: &str, queue: &str) -> Self {
        Self {
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Dead-lettered messages are republished with the queue name as routing
    /// key, so the binding does not depend on the key they were published with.
    pub fn routing_key(&self) -> &str {
        &self.queue
    }

    /// Points the dead-letter arguments of `queue` at this route.
    pub fn protect(&self, queue: QueueDefinition) -> QueueDefinition {
        queue.dead_letter(&self.exchange, self.routing_key())
    }

    /// Declarations for the route itself: the exchange, the queue and their binding.
    pub fn topology(&self) -> AmqpTopology {
        AmqpTopology::new()
            .exchange(ExchangeDefinition::new(&self.exchange).direct().durable())
            .queue(QueueDefinition::new(&self.queue).durable())
            .queue_binding(
                QueueBinding::new(&self.queue)
                    .exchange(&self.exchange)
                    .routing_key(self.routing_key()),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeKind;

    #[test]
    fn route_declares_durable_exchange_queue_and_binding() {
        let route = DeadLetterRoute::new("orders.dlx", "orders.dlq");
        let topology = route.topology();

        assert_eq!(topology.exchanges().len(), 1);
        assert_eq!(topology.exchanges()[0].name(), "orders.dlx");
        assert_eq!(topology.exchanges()[0].kind, ExchangeKind::Direct);
        assert!(topology.exchanges()[0].durable);

        assert_eq!(topology.queues().len(), 1);
        assert!(topology.queues()[0].durable);
        assert_eq!(topology.queues()[0].dead_letter_exchange, None);

        assert_eq!(
            topology.bindings().to_vec(),
            vec![QueueBinding::new("orders.dlq")
                .exchange("orders.dlx")
                .routing_key("orders.dlq")]
        );
    }

    #[test]
    fn protected_queue_points_at_the_route() {
        let route = DeadLetterRoute::new("orders.dlx", "orders.dlq");
        let queue = route.protect(QueueDefinition::new("orders").durable());

        assert_eq!(queue.dead_letter_exchange.as_deref(), Some(route.exchange()));
        assert_eq!(queue.dead_letter_routing_key.as_deref(), Some(route.queue()));
        assert!(queue.durable);
    }
}
