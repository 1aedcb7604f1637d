pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# LOGSHIP CONFIGURATION
# =============================================================================
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/logship/config.yml
#   3. /etc/logship/config.yml
#
# Durations accept humantime strings: 250ms, 1s, 30s, 5m.
# $env{VAR} references are expanded before parsing.

# Host identity stamped on every record (defaults to the machine hostname)
# host: web-01

# =============================================================================
# SOURCES
# =============================================================================
# Each entry pairs a glob pattern with the formatter used to parse its lines.
# Patterns are re-expanded every scanner.interval, so files created later are
# picked up automatically.
#
# Built-in formatters: raw, json, nginx_access, mongodb, docker_file_driver,
# python_traceback

sources:
  - pattern: /var/log/nginx/access.log
    formatter: nginx_access

  - pattern: /var/log/app/*.log
    formatter: json

  - pattern: /var/log/worker/*.log
    formatter: raw
    # Lines matching this regex are joined onto the previous record
    continuation: '^\s'

# =============================================================================
# SINK
# =============================================================================
sink:
  address: 127.0.0.1:4151
  topic: logs_and_metrics
  # Delivery pauses while the topic backlog is at or above this depth
  max_depth: 1000000
  heartbeat_topic: "Heartbeat#ephemeral"
  timeout: 5s

# =============================================================================
# STATE
# =============================================================================
# One cursor file per tracked log file is kept here so restarts resume where
# the last confirmed delivery left off.
state:
  dir: ~/.local/state/logship

# =============================================================================
# PIPELINE
# =============================================================================
queue:
  capacity: 2000
  put_timeout: 1s
  get_timeout: 1s

sender:
  max_batch_bytes: 5000000
  max_batch_age: 1s
  retry_wait: 1s
  restart_delay: 1s

tailer:
  poll_interval: 250ms
  restart_delay: 250ms
  # Emit a pending multi-line record after the file has been idle this long.
  # Leave unset to wait for the next record boundary.
  # flush_pending_after: 5s

scanner:
  interval: 30s
  # Stop tailing files that no longer exist
  retire_missing: false

heartbeat:
  enabled: true
  interval: 30s
  restart_delay: 30s
"#
    .to_string()
}
