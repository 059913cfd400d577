use std::collections::BTreeMap;

use velofit_types::{
    CamId, CameraConfig, FrameShape, ModuleError, Notification, NotificationLevel, Point,
    WidgetKind, WidgetUpdate,
};

/// Borrowed view of the frame being processed.
#[derive(Clone, Copy)]
pub struct FrameView<'a> {
    pub pixels: &'a [u8],
    pub shape: FrameShape,
}

/// UI side channel filled by stages during one frame.
pub struct UiContext {
    camera_id: CamId,
    frame_id: i64,
    next_notification: u32,
    pub(crate) notifications: Vec<Notification>,
    pub(crate) widgets: Vec<WidgetUpdate>,
}

impl UiContext {
    fn new(camera_id: CamId, frame_id: i64) -> Self {
        UiContext {
            camera_id,
            frame_id,
            next_notification: 0,
            notifications: Vec::new(),
            widgets: Vec::new(),
        }
    }

    pub fn notify<T: Into<String>, M: Into<String>>(
        &mut self,
        title: T,
        message: M,
        level: NotificationLevel,
        duration: f64,
    ) {
        let id = format!("{}.{}", self.frame_id, self.next_notification);
        self.next_notification += 1;
        self.notifications.push(Notification {
            id,
            title: title.into(),
            message: message.into(),
            level,
            duration,
        });
    }

    /// Queue a widget update. When `data` is a JSON object without a
    /// `camera_id` field, the hosting camera's id is injected so the
    /// front-end can partition widget streams by origin; plugins stay
    /// unaware of their host identity.
    pub fn update_widget<W: Into<String>, T: Into<String>>(
        &mut self,
        widget_id: W,
        title: T,
        mut data: serde_json::Value,
        kind: WidgetKind,
    ) {
        if let serde_json::Value::Object(map) = &mut data {
            if !map.contains_key("camera_id") {
                map.insert(
                    "camera_id".to_string(),
                    serde_json::Value::from(self.camera_id.0),
                );
            }
        }
        self.widgets.push(WidgetUpdate {
            widget_id: widget_id.into(),
            kind,
            title: title.into(),
            data,
        });
    }
}

/// Everything a stage sees while processing one frame. Built by the engine,
/// dropped after publication.
pub struct FrameContext<'a> {
    pub frame: FrameView<'a>,
    pub frame_id: i64,
    /// Capture timestamp, seconds.
    pub timestamp: f64,
    pub camera_id: CamId,
    pub config: &'a CameraConfig,
    /// The keypoint hand-off between the core stages: created by the
    /// detector, re-identified by the tracker, enriched downstream.
    pub points: Vec<Point>,
    pub ui: UiContext,
    pub(crate) store: BTreeMap<String, serde_json::Map<String, serde_json::Value>>,
    pub(crate) errors: Vec<ModuleError>,
}

impl<'a> FrameContext<'a> {
    pub fn new(
        frame: FrameView<'a>,
        frame_id: i64,
        timestamp: f64,
        config: &'a CameraConfig,
        camera_id: CamId,
    ) -> Self {
        FrameContext {
            frame,
            frame_id,
            timestamp,
            camera_id,
            config,
            points: Vec::new(),
            ui: UiContext::new(camera_id, frame_id),
            store: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    /// Publish a value for downstream stages and the stream payload.
    pub fn set_data<N, K>(&mut self, namespace: N, key: K, value: serde_json::Value)
    where
        N: Into<String>,
        K: Into<String>,
    {
        self.store
            .entry(namespace.into())
            .or_default()
            .insert(key.into(), value);
    }

    pub fn get_data(&self, namespace: &str, key: &str) -> Option<&serde_json::Value> {
        self.store.get(namespace).and_then(|ns| ns.get(key))
    }

    pub fn has_data(&self, namespace: &str, key: &str) -> bool {
        self.get_data(namespace, key).is_some()
    }

    pub fn add_error<S: Into<String>, M: Into<String>>(&mut self, source: S, message: M) {
        self.errors.push(ModuleError {
            source: source.into(),
            message: message.into(),
            timestamp: self.timestamp,
            severity: "error".to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_view() -> FrameView<'static> {
        FrameView {
            pixels: &[],
            shape: FrameShape::new(0, 0, 3),
        }
    }

    #[test]
    fn namespaced_store_roundtrip() {
        let config = CameraConfig::default();
        let mut ctx = FrameContext::new(empty_view(), 1, 0.0, &config, CamId(0));
        ctx.set_data("vision", "scale", serde_json::json!(10.0));
        assert!(ctx.has_data("vision", "scale"));
        assert_eq!(ctx.get_data("vision", "scale"), Some(&serde_json::json!(10.0)));
        assert!(!ctx.has_data("vision", "missing"));
    }

    #[test]
    fn widget_data_gains_camera_id() {
        let config = CameraConfig::default();
        let mut ctx = FrameContext::new(empty_view(), 1, 0.0, &config, CamId(4));
        ctx.ui.update_widget(
            "w",
            "Widget",
            serde_json::json!({"value": 3}),
            WidgetKind::Text,
        );
        assert_eq!(ctx.ui.widgets[0].data["camera_id"], 4);
    }

    #[test]
    fn widget_camera_id_not_overwritten() {
        let config = CameraConfig::default();
        let mut ctx = FrameContext::new(empty_view(), 1, 0.0, &config, CamId(4));
        ctx.ui.update_widget(
            "w",
            "Widget",
            serde_json::json!({"camera_id": 9}),
            WidgetKind::Text,
        );
        assert_eq!(ctx.ui.widgets[0].data["camera_id"], 9);
    }

    #[test]
    fn non_object_widget_data_left_alone() {
        let config = CameraConfig::default();
        let mut ctx = FrameContext::new(empty_view(), 1, 0.0, &config, CamId(4));
        ctx.ui
            .update_widget("w", "Widget", serde_json::json!("87.1"), WidgetKind::Text);
        assert_eq!(ctx.ui.widgets[0].data, serde_json::json!("87.1"));
    }

    #[test]
    fn notification_ids_are_unique_per_frame() {
        let config = CameraConfig::default();
        let mut ctx = FrameContext::new(empty_view(), 7, 0.0, &config, CamId(0));
        ctx.ui
            .notify("a", "first", NotificationLevel::Info, 3.0);
        ctx.ui
            .notify("b", "second", NotificationLevel::Warning, 3.0);
        assert_ne!(ctx.ui.notifications[0].id, ctx.ui.notifications[1].id);
    }
}
