use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};

use super::dispatcher::{PipelineReport, Termination};

impl PipelineReport {
    /// Counters as `(name, value)` pairs, in display order.
    pub fn counters(&self) -> Vec<(&'static str, u64)> {
        let mut counters = vec![
            ("events received", self.channel.delivered),
            ("events lost", self.channel.dropped),
        ];
        if let Some(input) = &self.input {
            counters.extend([
                ("input records read", input.delivered),
                ("input records lost", input.dropped),
                ("ring overwrites", self.overwritten),
            ]);
        }
        counters.extend([
            ("events decoded", self.decoded),
            ("decode errors", self.decode_errors),
            ("events filtered", self.filtered),
            ("rules", self.rules as u64),
            ("rule reloads", self.rule_reloads),
            ("rule matches", self.matches),
            ("alerts", self.alerts),
            ("alerts dropped (queue full)", self.alerts_queue_dropped),
            ("process cache hits", self.cache.hits),
            ("process cache misses", self.cache.misses),
            ("process cache evictions", self.cache.evictions),
            ("process cache expirations", self.cache.expirations),
        ]);
        if let Some(delivery) = &self.delivery {
            counters.extend([
                ("alerts delivered", delivery.delivered),
                ("delivery retries", delivery.retries),
                ("alerts dropped (sink errors)", delivery.dropped),
            ]);
        }
        counters
    }

    pub fn table(&self) -> Table {
        let mut table = Table::new();
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![
            Cell::new("COUNTER").add_attribute(Attribute::Bold),
            Cell::new("VALUE").add_attribute(Attribute::Bold),
        ]);

        let termination_color = match self.termination {
            Termination::Shutdown => Color::Green,
            Termination::ChannelClosed => Color::Yellow,
            Termination::ChannelFailed(_) => Color::Red,
        };
        table.add_row(vec![
            Cell::new("termination")
                .fg(Color::Cyan)
                .add_attribute(Attribute::Bold),
            Cell::new(self.termination.to_string())
                .fg(termination_color)
                .add_attribute(Attribute::Bold),
        ]);

        for (name, value) in self.counters() {
            let value_cell = match name {
                "events lost"
                | "input records lost"
                | "ring overwrites"
                | "decode errors"
                | "alerts dropped (queue full)"
                | "alerts dropped (sink errors)"
                    if value > 0 =>
                {
                    Cell::new(value).fg(Color::Yellow)
                }
                _ => Cell::new(value),
            };
            table.add_row(vec![
                Cell::new(name).fg(Color::Cyan).add_attribute(Attribute::Bold),
                value_cell,
            ]);
        }
        table
    }

    /// Log the counters, one line.
    pub fn log(&self) {
        let summary = self
            .counters()
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(", ");
        log::info!("Pipeline stopped ({}): {summary}", self.termination);
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use kwatch_core::sink::DeliveryStats;
    use probe_common::{ChannelError, ChannelStats, channel::Forwarded};

    use super::*;

    fn report() -> PipelineReport {
        let mut report = PipelineReport::new(3);
        report.decoded = 10;
        report.decode_errors = 2;
        report.alerts = 4;
        report
    }

    #[test]
    fn counters_include_delivery_once_known() {
        let mut report = report();
        let names: Vec<_> = report.counters().into_iter().map(|(name, _)| name).collect();
        assert!(!names.contains(&"alerts delivered"));

        report.delivery = Some(DeliveryStats {
            delivered: 4,
            retries: 1,
            dropped: 0,
        });
        let counters = report.counters();
        assert!(counters.contains(&("alerts delivered", 4)));
        assert!(counters.contains(&("decode errors", 2)));
        assert!(counters.contains(&("rules", 3)));
    }

    #[test]
    fn input_failure_overrides_channel_closed() {
        let mut failed = report();
        failed.termination = Termination::ChannelClosed;
        failed.record_input(Forwarded {
            input: ChannelStats {
                delivered: 12,
                dropped: 3,
            },
            overwritten: 5,
            error: Some(ChannelError::Io(io::Error::other("read failed"))),
        });
        assert_eq!(
            failed.termination,
            Termination::ChannelFailed("reading event channel".to_string())
        );
        let counters = failed.counters();
        assert!(counters.contains(&("input records read", 12)));
        assert!(counters.contains(&("input records lost", 3)));
        assert!(counters.contains(&("ring overwrites", 5)));

        let mut closed = report();
        closed.termination = Termination::ChannelClosed;
        closed.record_input(Forwarded {
            input: ChannelStats::default(),
            overwritten: 0,
            error: None,
        });
        assert_eq!(closed.termination, Termination::ChannelClosed);
    }

    #[test]
    fn table_lists_counters() {
        let mut report = report();
        report.termination = Termination::ChannelFailed("boom".to_string());
        let rendered = report.table().to_string();
        assert!(rendered.contains("event channel failed: boom"));
        assert!(rendered.contains("decode errors"));
        assert!(rendered.contains("events decoded"));
    }
}
