//! Scriptable in-memory browser for unit tests.
//!
//! Pages are named element sets; URLs map to pages through routes, and
//! clicks can navigate, toggle, or serve a download.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{Browser, ElementRef, Locator, TabId};
use crate::error::BrowserError;

/// What a click does.
#[derive(Debug, Clone)]
pub(crate) enum Effect {
    /// Show another page in the current tab.
    Navigate(&'static str),
    /// Flip the checked state.
    Toggle,
    /// Serve these bytes when the element is used as a download trigger.
    Download(Vec<u8>),
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeElement {
    hidden: bool,
    disabled: bool,
    selected: bool,
    /// Successive `text()` results; the last one repeats.
    texts: Vec<String>,
    absent_for: u32,
    click_failures: u32,
    on_click: Vec<Effect>,
}

impl FakeElement {
    pub fn visible() -> Self {
        Self::default()
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn checked(mut self) -> Self {
        self.selected = true;
        self
    }

    /// Reads return these texts in order, then keep returning the last.
    pub fn texts(mut self, texts: &[&str]) -> Self {
        self.texts = texts.iter().map(|t| t.to_string()).collect();
        self
    }

    /// `find` misses the element this many times before it appears.
    pub fn absent_for(mut self, finds: u32) -> Self {
        self.absent_for = finds;
        self
    }

    /// The first `n` clicks fail as not interactable.
    pub fn failing_clicks(mut self, n: u32) -> Self {
        self.click_failures = n;
        self
    }

    pub fn on_click(mut self, effect: Effect) -> Self {
        self.on_click.push(effect);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakePage {
    text: String,
    elements: Vec<(Locator, FakeElement)>,
}

impl FakePage {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            elements: Vec::new(),
        }
    }

    pub fn with(mut self, locator: Locator, element: FakeElement) -> Self {
        self.elements.push((locator, element));
        self
    }
}

struct Tab {
    id: TabId,
    page: String,
    url: String,
}

struct State {
    pages: HashMap<String, FakePage>,
    routes: Vec<(String, String)>,
    tabs: Vec<Tab>,
    current: usize,
    next_tab: u32,
    find_counts: HashMap<Locator, u32>,
    values: HashMap<(String, Locator), String>,
    events: Vec<String>,
    downloads: u32,
    quit: bool,
}

pub(crate) struct FakeBrowser {
    state: Mutex<State>,
    download_dir: tempfile::TempDir,
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                pages: HashMap::from([("blank".to_string(), FakePage::default())]),
                routes: Vec::new(),
                tabs: vec![Tab {
                    id: TabId("tab-0".into()),
                    page: "blank".into(),
                    url: "about:blank".into(),
                }],
                current: 0,
                next_tab: 1,
                find_counts: HashMap::new(),
                values: HashMap::new(),
                events: Vec::new(),
                downloads: 0,
                quit: false,
            }),
            download_dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn page(self, name: &str, page: FakePage) -> Self {
        self.state.lock().unwrap().pages.insert(name.to_string(), page);
        self
    }

    /// URLs containing `fragment` load page `name`.
    pub fn route(self, fragment: &str, name: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .routes
            .push((fragment.to_string(), name.to_string()));
        self
    }

    /// Show page `name` in the current tab.
    pub fn show(&self, name: &str) {
        let mut s = self.state.lock().unwrap();
        let current = s.current;
        s.tabs[current].page = name.to_string();
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }

    /// Value last typed or assigned into `locator` on page `page`.
    pub fn value_of(&self, page: &str, locator: &Locator) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .values
            .get(&(page.to_string(), locator.clone()))
            .cloned()
    }

    pub fn find_count(&self, locator: &Locator) -> u32 {
        self.state
            .lock()
            .unwrap()
            .find_counts
            .get(locator)
            .copied()
            .unwrap_or(0)
    }

    pub fn open_tab_count(&self) -> usize {
        self.state.lock().unwrap().tabs.len()
    }

    pub fn is_quit(&self) -> bool {
        self.state.lock().unwrap().quit
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download_dir.path().to_path_buf()
    }
}

impl State {
    fn page_for(&self, url: &str) -> String {
        self.routes
            .iter()
            .find(|(fragment, _)| url.contains(fragment.as_str()))
            .map(|(_, page)| page.clone())
            .unwrap_or_else(|| "blank".to_string())
    }

    fn current_page(&self) -> &str {
        &self.tabs[self.current].page
    }

    /// Resolve an element handle against the current tab.
    fn element(&mut self, element: &ElementRef) -> Result<(String, &mut (Locator, FakeElement)), BrowserError> {
        let (page, index) = element
            .0
            .rsplit_once('#')
            .and_then(|(p, i)| i.parse::<usize>().ok().map(|i| (p.to_string(), i)))
            .ok_or_else(|| BrowserError::StaleElement(element.0.clone()))?;
        if page != self.tabs[self.current].page {
            return Err(BrowserError::StaleElement(element.0.clone()));
        }
        let entry = self
            .pages
            .get_mut(&page)
            .and_then(|p| p.elements.get_mut(index))
            .ok_or_else(|| BrowserError::StaleElement(element.0.clone()))?;
        Ok((page, entry))
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        let mut s = self.state.lock().unwrap();
        let page = s.page_for(url);
        let current = s.current;
        s.tabs[current].page = page;
        s.tabs[current].url = url.to_string();
        s.events.push(format!("goto:{url}"));
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        let s = self.state.lock().unwrap();
        Ok(s.tabs[s.current].url.clone())
    }

    async fn page_text(&self) -> Result<String, BrowserError> {
        let s = self.state.lock().unwrap();
        Ok(s.pages
            .get(s.current_page())
            .map(|p| p.text.clone())
            .unwrap_or_default())
    }

    async fn find(&self, locator: &Locator) -> Result<Option<ElementRef>, BrowserError> {
        let mut s = self.state.lock().unwrap();
        let count = {
            let c = s.find_counts.entry(locator.clone()).or_insert(0);
            *c += 1;
            *c
        };
        let page = s.current_page().to_string();
        let Some(index) = s
            .pages
            .get(&page)
            .and_then(|p| p.elements.iter().position(|(l, _)| l == locator))
        else {
            return Ok(None);
        };
        let absent_for = s.pages[&page].elements[index].1.absent_for;
        if count <= absent_for {
            return Ok(None);
        }
        Ok(Some(ElementRef(format!("{page}#{index}"))))
    }

    async fn is_displayed(&self, element: &ElementRef) -> Result<bool, BrowserError> {
        let mut s = self.state.lock().unwrap();
        let (_, (_, el)) = s.element(element)?;
        Ok(!el.hidden)
    }

    async fn is_enabled(&self, element: &ElementRef) -> Result<bool, BrowserError> {
        let mut s = self.state.lock().unwrap();
        let (_, (_, el)) = s.element(element)?;
        Ok(!el.disabled)
    }

    async fn is_selected(&self, element: &ElementRef) -> Result<bool, BrowserError> {
        let mut s = self.state.lock().unwrap();
        let (_, (_, el)) = s.element(element)?;
        Ok(el.selected)
    }

    async fn text(&self, element: &ElementRef) -> Result<String, BrowserError> {
        let mut s = self.state.lock().unwrap();
        let (_, (locator, el)) = s.element(element)?;
        let text = if el.texts.len() > 1 {
            el.texts.remove(0)
        } else {
            el.texts.first().cloned().unwrap_or_default()
        };
        let event = format!("read:{locator}={text}");
        s.events.push(event);
        Ok(text)
    }

    async fn fill(&self, element: &ElementRef, value: &str) -> Result<(), BrowserError> {
        let mut s = self.state.lock().unwrap();
        let (page, (locator, _)) = s.element(element)?;
        let locator = locator.clone();
        s.events.push(format!("fill:{locator}={value}"));
        s.values.insert((page, locator), value.to_string());
        Ok(())
    }

    async fn set_value(&self, element: &ElementRef, value: &str) -> Result<(), BrowserError> {
        let mut s = self.state.lock().unwrap();
        let (page, (locator, _)) = s.element(element)?;
        let locator = locator.clone();
        s.events.push(format!("set_value:{locator}={value}"));
        s.values.insert((page, locator), value.to_string());
        Ok(())
    }

    async fn click(&self, element: &ElementRef) -> Result<(), BrowserError> {
        let mut s = self.state.lock().unwrap();
        let (_, (locator, el)) = s.element(element)?;
        let locator = locator.clone();
        if el.click_failures > 0 {
            el.click_failures -= 1;
            s.events.push(format!("click-failed:{locator}"));
            return Err(BrowserError::Protocol {
                error: "element not interactable".into(),
                message: locator.to_string(),
            });
        }
        let mut navigate = None;
        for effect in el.on_click.clone() {
            match effect {
                Effect::Toggle => el.selected = !el.selected,
                Effect::Navigate(page) => navigate = Some(page),
                Effect::Download(_) => {}
            }
        }
        s.events.push(format!("click:{locator}"));
        if let Some(page) = navigate {
            let current = s.current;
            s.tabs[current].page = page.to_string();
        }
        Ok(())
    }

    async fn download(
        &self,
        element: &ElementRef,
        timeout: Duration,
    ) -> Result<PathBuf, BrowserError> {
        let mut s = self.state.lock().unwrap();
        let (_, (locator, el)) = s.element(element)?;
        let locator = locator.clone();
        let bytes = el.on_click.iter().find_map(|e| match e {
            Effect::Download(bytes) => Some(bytes.clone()),
            _ => None,
        });
        let Some(bytes) = bytes else {
            return Err(BrowserError::DownloadTimeout(timeout));
        };
        s.downloads += 1;
        let path = self.download_dir.path().join(format!("export-{}.csv", s.downloads));
        std::fs::write(&path, bytes)?;
        s.events.push(format!("download:{locator}"));
        Ok(path)
    }

    async fn current_tab(&self) -> Result<TabId, BrowserError> {
        let s = self.state.lock().unwrap();
        Ok(s.tabs[s.current].id.clone())
    }

    async fn open_tab(&self, url: &str) -> Result<TabId, BrowserError> {
        let mut s = self.state.lock().unwrap();
        let id = TabId(format!("tab-{}", s.next_tab));
        s.next_tab += 1;
        let page = s.page_for(url);
        s.tabs.push(Tab {
            id: id.clone(),
            page,
            url: url.to_string(),
        });
        s.current = s.tabs.len() - 1;
        s.events.push(format!("open_tab:{url}"));
        Ok(id)
    }

    async fn switch_to(&self, tab: &TabId) -> Result<(), BrowserError> {
        let mut s = self.state.lock().unwrap();
        let index = s
            .tabs
            .iter()
            .position(|t| &t.id == tab)
            .ok_or_else(|| BrowserError::UnknownTab(tab.0.clone()))?;
        s.current = index;
        s.events.push(format!("switch:{tab}"));
        Ok(())
    }

    async fn close_tab(&self, tab: &TabId) -> Result<(), BrowserError> {
        let mut s = self.state.lock().unwrap();
        let index = s
            .tabs
            .iter()
            .position(|t| &t.id == tab)
            .ok_or_else(|| BrowserError::UnknownTab(tab.0.clone()))?;
        s.tabs.remove(index);
        if s.current >= index && s.current > 0 {
            s.current -= 1;
        }
        s.events.push(format!("close:{tab}"));
        Ok(())
    }

    async fn quit(&self) -> Result<(), BrowserError> {
        let mut s = self.state.lock().unwrap();
        s.quit = true;
        s.events.push("quit".into());
        Ok(())
    }
}
