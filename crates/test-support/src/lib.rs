pub const SERVICE: &str = "conference.example.org";
pub const ROOM: &str = "test";
pub const ROOM_JID: &str = "test@conference.example.org";
pub const NICK: &str = "Nick";
pub const OCCUPANT_JID: &str = "test@conference.example.org/Nick";
pub const USER_JID: &str = "test@jabber.org/Testing";

pub mod fixtures {
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};

    pub fn root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    pub fn path(relative: impl AsRef<Path>) -> PathBuf {
        root().join(relative.as_ref())
    }

    pub fn read(relative: impl AsRef<Path>) -> io::Result<String> {
        fs::read_to_string(path(relative))
    }

    pub fn stanza(name: &str) -> String {
        read_or_panic(Path::new("stanzas").join(name))
    }

    /// Load a stanza fixture and fill in its `{placeholder}`s.
    ///
    /// Panics if a placeholder is left without a value.
    pub fn render(name: &str, values: &[(&str, &str)]) -> String {
        let mut rendered = stanza(name);
        for (key, value) in values {
            rendered = rendered.replace(&format!("{{{key}}}"), value);
        }
        if let Some(start) = rendered.find('{') {
            let end = rendered[start..]
                .find('}')
                .map_or(rendered.len(), |end| start + end + 1);
            panic!(
                "fixture {name} has unfilled placeholder {}",
                &rendered[start..end]
            );
        }
        rendered
    }

    fn read_or_panic(relative: impl AsRef<Path>) -> String {
        let relative = relative.as_ref();
        read(relative).unwrap_or_else(|error| {
            panic!(
                "failed to read fixture {}: {error}",
                relative.to_string_lossy()
            )
        })
    }
}

/// Inspection of serialized outbound stanzas.
pub mod xml {
    use xmpp_parsers::minidom::Element;

    pub fn parse(payload: &[u8]) -> Element {
        let raw = std::str::from_utf8(payload)
            .unwrap_or_else(|error| panic!("outbound stanza is not UTF-8: {error}"));
        raw.parse()
            .unwrap_or_else(|error| panic!("outbound stanza is not XML ({error}): {raw}"))
    }

    /// Follow a `/`-separated path of child element names, e.g.
    /// `"query/item"`, taking the first match at each step.
    pub fn find<'a>(root: &'a Element, path: &str) -> Option<&'a Element> {
        path.split('/')
            .filter(|step| !step.is_empty())
            .try_fold(root, |element, step| {
                element.children().find(|child| child.name() == step)
            })
    }

    pub fn attr<'a>(root: &'a Element, path: &str, name: &'a str) -> Option<&'a str> {
        find(root, path)?.attr(name)
    }

    pub fn text(root: &Element, path: &str) -> Option<String> {
        find(root, path).map(Element::text)
    }

    pub fn all<'a>(root: &'a Element, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        root.children().filter(move |child| child.name() == name)
    }
}
