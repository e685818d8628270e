//! Prometheus text exposition format.
//!
//! Renders engine status, host registry state and sampled utilization
//! for scraping at `/metrics`.

use hyperfleet_cluster::{HostView, Liveness};
use hyperfleet_scheduler::EngineStatus;

use crate::collector::HostMetrics;

fn escape(label: &str) -> String {
    label
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn header(out: &mut String, name: &str, kind: &str, help: &str) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} {kind}\n"));
}

/// Render the controller's observable state in Prometheus text format.
pub fn render_prometheus(status: &EngineStatus, hosts: &[HostView], utilization: &[HostMetrics]) -> String {
    let mut out = String::new();

    header(&mut out, "hyperfleet_reconcile_ticks_total", "counter", "Reconciliation ticks completed.");
    out.push_str(&format!("hyperfleet_reconcile_ticks_total {}\n", status.ticks));

    header(&mut out, "hyperfleet_last_tick_timestamp_seconds", "gauge", "Unix time of the last completed tick.");
    out.push_str(&format!(
        "hyperfleet_last_tick_timestamp_seconds {}\n",
        status.last_tick_at.unwrap_or(0)
    ));

    for (name, help, value) in [
        ("hyperfleet_vm_creates_total", "Successful VM creates.", status.creates_total),
        ("hyperfleet_vm_destroys_total", "Successful VM destroys.", status.destroys_total),
        ("hyperfleet_instances_failed_total", "Instances that exhausted their retries.", status.failed_total),
        ("hyperfleet_instances_lost_total", "Running instances whose VM disappeared.", status.lost_total),
    ] {
        header(&mut out, name, "counter", help);
        out.push_str(&format!("{name} {value}\n"));
    }

    header(&mut out, "hyperfleet_group_desired_size", "gauge", "Desired instance count per group.");
    for g in &status.groups {
        out.push_str(&format!(
            "hyperfleet_group_desired_size{{group=\"{}\"}} {}\n",
            escape(&g.group),
            g.desired_size
        ));
    }

    header(&mut out, "hyperfleet_group_size_bounds", "gauge", "Configured min and max size per group.");
    for g in &status.groups {
        let group = escape(&g.group);
        out.push_str(&format!("hyperfleet_group_size_bounds{{group=\"{group}\",bound=\"min\"}} {}\n", g.min_size));
        out.push_str(&format!("hyperfleet_group_size_bounds{{group=\"{group}\",bound=\"max\"}} {}\n", g.max_size));
    }

    header(&mut out, "hyperfleet_group_instances", "gauge", "Instances per group by lifecycle state.");
    for g in &status.groups {
        let group = escape(&g.group);
        for (state, n) in [
            ("requested", g.requested),
            ("provisioning", g.provisioning),
            ("running", g.running),
            ("terminating", g.terminating),
            ("failed", g.failed),
        ] {
            out.push_str(&format!(
                "hyperfleet_group_instances{{group=\"{group}\",state=\"{state}\"}} {n}\n"
            ));
        }
    }

    header(&mut out, "hyperfleet_group_cleanup_pending", "gauge", "Failed instances whose VM is not yet confirmed destroyed.");
    for g in &status.groups {
        out.push_str(&format!(
            "hyperfleet_group_cleanup_pending{{group=\"{}\"}} {}\n",
            escape(&g.group),
            g.cleanup_pending
        ));
    }

    header(&mut out, "hyperfleet_group_capacity_exhausted", "gauge", "1 while placement for the group finds no host.");
    for g in &status.groups {
        out.push_str(&format!(
            "hyperfleet_group_capacity_exhausted{{group=\"{}\"}} {}\n",
            escape(&g.group),
            u8::from(g.capacity_exhausted_since.is_some())
        ));
    }

    header(&mut out, "hyperfleet_host_up", "gauge", "1 if the host is reachable.");
    for h in hosts {
        out.push_str(&format!(
            "hyperfleet_host_up{{host=\"{}\"}} {}\n",
            escape(&h.spec.name),
            u8::from(h.liveness == Liveness::Reachable)
        ));
    }

    header(&mut out, "hyperfleet_host_cpu_cores", "gauge", "Host vCPU capacity and allocation.");
    for h in hosts {
        let host = escape(&h.spec.name);
        out.push_str(&format!("hyperfleet_host_cpu_cores{{host=\"{host}\",kind=\"capacity\"}} {}\n", h.capacity.capacity.cpu_cores));
        out.push_str(&format!("hyperfleet_host_cpu_cores{{host=\"{host}\",kind=\"allocated\"}} {}\n", h.capacity.allocated.cpu_cores));
    }

    header(&mut out, "hyperfleet_host_memory_bytes", "gauge", "Host memory capacity and allocation.");
    for h in hosts {
        let host = escape(&h.spec.name);
        out.push_str(&format!("hyperfleet_host_memory_bytes{{host=\"{host}\",kind=\"capacity\"}} {}\n", h.capacity.capacity.memory_bytes));
        out.push_str(&format!("hyperfleet_host_memory_bytes{{host=\"{host}\",kind=\"allocated\"}} {}\n", h.capacity.allocated.memory_bytes));
    }

    header(&mut out, "hyperfleet_host_utilization", "gauge", "Trailing average utilization (0.0-1.0).");
    for m in utilization {
        let host = escape(&m.host);
        out.push_str(&format!("hyperfleet_host_utilization{{host=\"{host}\",resource=\"cpu\"}} {:.4}\n", m.cpu));
        out.push_str(&format!("hyperfleet_host_utilization{{host=\"{host}\",resource=\"memory\"}} {:.4}\n", m.memory));
    }

    out
}
