//! Message routing to the caller.
//!
//! The codec never prints; everything user-visible goes through one of
//! three registered handlers. Levels without a handler fall back to the
//! `log` facade so library users still see diagnostics.

use std::fmt;
use std::sync::Arc;

pub type MsgHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
  Info,
  Warning,
  Error,
}

#[derive(Clone, Default)]
pub struct EventMgr {
  info_handler: Option<MsgHandler>,
  warning_handler: Option<MsgHandler>,
  error_handler: Option<MsgHandler>,
}

impl fmt::Debug for EventMgr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EventMgr")
      .field("info", &self.info_handler.is_some())
      .field("warning", &self.warning_handler.is_some())
      .field("error", &self.error_handler.is_some())
      .finish()
  }
}

impl EventMgr {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_info_handler(&mut self, handler: MsgHandler) {
    self.info_handler = Some(handler);
  }

  pub fn set_warning_handler(&mut self, handler: MsgHandler) {
    self.warning_handler = Some(handler);
  }

  pub fn set_error_handler(&mut self, handler: MsgHandler) {
    self.error_handler = Some(handler);
  }

  fn handler(&self, event_type: EventType) -> Option<&MsgHandler> {
    match event_type {
      EventType::Info => self.info_handler.as_ref(),
      EventType::Warning => self.warning_handler.as_ref(),
      EventType::Error => self.error_handler.as_ref(),
    }
  }

  pub fn msg(&self, event_type: EventType, msg: &str) {
    match self.handler(event_type) {
      Some(handler) => handler(msg),
      None => match event_type {
        EventType::Info => log::info!("{}", msg),
        EventType::Warning => log::warn!("{}", msg),
        EventType::Error => log::error!("{}", msg),
      },
    }
  }

  pub fn info(&self, msg: impl AsRef<str>) {
    self.msg(EventType::Info, msg.as_ref());
  }

  pub fn warning(&self, msg: impl AsRef<str>) {
    self.msg(EventType::Warning, msg.as_ref());
  }

  pub fn error(&self, msg: impl AsRef<str>) {
    self.msg(EventType::Error, msg.as_ref());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;

  #[test]
  fn routes_to_registered_handler() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mut mgr = EventMgr::new();
    mgr.set_error_handler(Arc::new(move |m| sink.lock().unwrap().push(m.to_string())));
    mgr.error("bad marker");
    mgr.info("ignored by test, goes to log");
    assert_eq!(&*seen.lock().unwrap(), &["bad marker".to_string()]);
  }
}
