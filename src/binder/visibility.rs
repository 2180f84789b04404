use std::sync::Mutex;

/// Tells the binder which page is currently on screen.
pub trait VisibilityOracle: Send + Sync {
  fn visible_page(&self) -> Option<String>;

  fn is_visible(&self, page: &str) -> bool {
    self.visible_page().as_deref() == Some(page)
  }
}

/// A visibility oracle driven by explicit navigation.
#[derive(Debug, Default)]
pub struct CurrentPage {
  page: Mutex<Option<String>>,
}

impl CurrentPage {
  pub fn new(page: Option<String>) -> Self {
    Self {
      page: Mutex::new(page),
    }
  }

  pub fn set(&self, page: Option<String>) {
    *self.page.lock().unwrap_or_else(|e| e.into_inner()) = page;
  }
}

impl VisibilityOracle for CurrentPage {
  fn visible_page(&self) -> Option<String> {
    self.page.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_current_page() {
    let oracle = CurrentPage::default();
    assert!(!oracle.is_visible("overview"));

    oracle.set(Some("overview".into()));
    assert!(oracle.is_visible("overview"));
    assert!(!oracle.is_visible("details"));
  }
}
