pub const WEB_LAB: &str = include_str!("../../../demos/web_lab.yaml");
